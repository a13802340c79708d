use std::fs;
use std::path::Path;

use crate::behavior::Deviation;
use crate::error::{Result, SimulationError};
use crate::{PartyId, Protocol, NO_PARTY};

/// One `@<party>@<label>@<value>` line from the INPUTS section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputSpec {
    pub party: PartyId,
    pub label: String,
    pub value: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComparatorSpec {
    pub bitlength: u32,
    pub label_a: String,
    pub label_b: String,
    pub label_one: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeqRunSpec {
    pub prev_result_label: String,
    pub next_circuit_desc: String,
}

/// Parsed options file.
///
/// The file is line oriented: lines starting with `#` advance to the next
/// section, lines starting with `@` carry `@`-separated data for the
/// current section. Sections appear in a fixed order: N, T, FIELD_PRIME,
/// PROTOCOL, INPUTS, CORRUPT, DATA_USER, COMPARATOR, CIRCUIT_DESC, SEQ_RUN.
#[derive(Debug, Clone)]
pub struct SimulatorOptions {
    pub n: usize,
    pub threshold: usize,
    pub field_prime: u64,
    pub protocol: Protocol,
    pub secrets: Vec<InputSpec>,
    pub corrupted: Vec<(PartyId, Vec<Deviation>)>,
    pub data_user: PartyId,
    pub comparator: Option<ComparatorSpec>,
    pub circuit_desc: String,
    pub seq_run: Option<SeqRunSpec>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Start,
    N,
    T,
    FieldPrime,
    Protocol,
    Inputs,
    Corrupt,
    DataUser,
    Comparator,
    CircuitDesc,
    SeqRun,
    Finish,
}

impl Section {
    fn next(self) -> Section {
        match self {
            Section::Start => Section::N,
            Section::N => Section::T,
            Section::T => Section::FieldPrime,
            Section::FieldPrime => Section::Protocol,
            Section::Protocol => Section::Inputs,
            Section::Inputs => Section::Corrupt,
            Section::Corrupt => Section::DataUser,
            Section::DataUser => Section::Comparator,
            Section::Comparator => Section::CircuitDesc,
            Section::CircuitDesc => Section::SeqRun,
            _ => Section::Finish,
        }
    }
}

fn parse_num<T: std::str::FromStr>(tok: &str, what: &str) -> Result<T> {
    tok.parse()
        .map_err(|_| SimulationError::Options(format!("bad {what}: {tok}")))
}

impl SimulatorOptions {
    pub fn from_path(path: &Path) -> Result<SimulatorOptions> {
        let text = fs::read_to_string(path)?;
        text.parse()
    }
}

impl std::str::FromStr for SimulatorOptions {
    type Err = SimulationError;

    fn from_str(text: &str) -> Result<SimulatorOptions> {
        let mut opts = SimulatorOptions {
            n: 0,
            threshold: 0,
            field_prime: 0,
            protocol: Protocol::None,
            secrets: Vec::new(),
            corrupted: Vec::new(),
            data_user: NO_PARTY,
            comparator: None,
            circuit_desc: String::new(),
            seq_run: None,
        };
        let mut section = Section::Start;
        for raw in text.lines() {
            // strip every whitespace character before looking at the line
            let line: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
            if line.is_empty() {
                continue;
            }
            if line.starts_with('#') {
                section = section.next();
                continue;
            }
            if !line.starts_with('@') {
                return Err(SimulationError::Options(format!("bad line: {raw}")));
            }
            let tokens: Vec<&str> = line.split('@').filter(|t| !t.is_empty()).collect();
            if tokens.is_empty() {
                return Err(SimulationError::Options(format!("bad line: {raw}")));
            }
            match section {
                Section::N => opts.n = parse_num(tokens[0], "party count")?,
                Section::T => opts.threshold = parse_num(tokens[0], "threshold")?,
                Section::FieldPrime => {
                    opts.field_prime = parse_num(tokens[0], "field prime")?
                }
                Section::Protocol => {
                    let code: u64 = parse_num(tokens[0], "protocol code")?;
                    opts.protocol = Protocol::from_code(code).ok_or_else(|| {
                        SimulationError::Options(format!("bad protocol code: {code}"))
                    })?;
                }
                Section::Inputs => {
                    if tokens.len() != 3 {
                        return Err(SimulationError::Options(format!("bad input line: {raw}")));
                    }
                    opts.secrets.push(InputSpec {
                        party: parse_num(tokens[0], "input party")?,
                        label: tokens[1].to_string(),
                        value: parse_num(tokens[2], "input value")?,
                    });
                }
                Section::Corrupt => {
                    let party = parse_num(tokens[0], "corrupt party")?;
                    let deviations = tokens[1..]
                        .iter()
                        .map(|t| t.parse())
                        .collect::<Result<Vec<Deviation>>>()?;
                    opts.corrupted.push((party, deviations));
                }
                Section::DataUser => opts.data_user = parse_num(tokens[0], "data user")?,
                Section::Comparator => {
                    if tokens[0].eq_ignore_ascii_case("true") {
                        if tokens.len() != 5 {
                            return Err(SimulationError::Options(format!(
                                "bad comparator line: {raw}"
                            )));
                        }
                        opts.comparator = Some(ComparatorSpec {
                            bitlength: parse_num(tokens[1], "bitlength")?,
                            label_a: tokens[2].to_string(),
                            label_b: tokens[3].to_string(),
                            label_one: tokens[4].to_string(),
                        });
                    } else if !tokens[0].eq_ignore_ascii_case("false") {
                        return Err(SimulationError::Options(format!(
                            "bad comparator line: {raw}"
                        )));
                    }
                }
                Section::CircuitDesc => {
                    if opts.comparator.is_none() {
                        opts.circuit_desc = tokens[0].to_string();
                    }
                }
                Section::SeqRun => {
                    if opts.comparator.is_none() {
                        if tokens[0].eq_ignore_ascii_case("true") {
                            if tokens.len() != 3 {
                                return Err(SimulationError::Options(format!(
                                    "bad sequential-run line: {raw}"
                                )));
                            }
                            opts.seq_run = Some(SeqRunSpec {
                                prev_result_label: tokens[1].to_string(),
                                next_circuit_desc: tokens[2].to_string(),
                            });
                        } else if !tokens[0].eq_ignore_ascii_case("false") {
                            return Err(SimulationError::Options(format!(
                                "bad sequential-run line: {raw}"
                            )));
                        }
                    }
                }
                Section::Start | Section::Finish => {
                    return Err(SimulationError::Options("bad options file".into()))
                }
            }
        }
        Ok(opts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
# N
@3
# T
@2
# FIELD_PRIME
@2039
# PROTOCOL
@2
# INPUTS
@1@a@3
@2@b@5
@3@c@7
# CORRUPT
@2@commitment_send_invalid_share
# DATA_USER
@1
# COMPARATOR
@FALSE
# CIRCUIT_DESC
@(a+b)*(c.2)
# SEQ_RUN
@FALSE
";

    #[test]
    fn parses_a_full_file() {
        let opts: SimulatorOptions = SAMPLE.parse().unwrap();
        assert_eq!(opts.n, 3);
        assert_eq!(opts.threshold, 2);
        assert_eq!(opts.field_prime, 2039);
        assert_eq!(opts.protocol, Protocol::Ceas);
        assert_eq!(opts.secrets.len(), 3);
        assert_eq!(
            opts.secrets[1],
            InputSpec {
                party: 2,
                label: "b".into(),
                value: 5
            }
        );
        assert_eq!(opts.corrupted.len(), 1);
        assert_eq!(opts.corrupted[0].0, 2);
        assert_eq!(
            opts.corrupted[0].1,
            vec![Deviation::CommitmentSendInvalidShare]
        );
        assert_eq!(opts.data_user, 1);
        assert!(opts.comparator.is_none());
        assert_eq!(opts.circuit_desc, "(a+b)*(c.2)");
        assert!(opts.seq_run.is_none());
    }

    #[test]
    fn whitespace_is_stripped_before_parsing() {
        let spaced = SAMPLE.replace("@1@a@3", "@ 1 @ a @ 3");
        let opts: SimulatorOptions = spaced.parse().unwrap();
        assert_eq!(opts.secrets[0].label, "a");
    }

    #[test]
    fn comparator_and_seq_run_variants() {
        let text = SAMPLE
            .replace("@FALSE\n# CIRCUIT_DESC", "@TRUE@3@a@b@one\n# CIRCUIT_DESC")
            .replace("# SEQ_RUN\n@FALSE", "# SEQ_RUN\n@TRUE@r@r+a");
        let opts: SimulatorOptions = text.parse().unwrap();
        let cmp = opts.comparator.unwrap();
        assert_eq!(cmp.bitlength, 3);
        assert_eq!(cmp.label_one, "one");
        // comparator wins over circuit description and sequential run
        assert!(opts.circuit_desc.is_empty());
        assert!(opts.seq_run.is_none());

        let text = SAMPLE.replace("# SEQ_RUN\n@FALSE", "# SEQ_RUN\n@TRUE@r@r+a");
        let opts: SimulatorOptions = text.parse().unwrap();
        let seq = opts.seq_run.unwrap();
        assert_eq!(seq.prev_result_label, "r");
        assert_eq!(seq.next_circuit_desc, "r+a");
    }

    #[test]
    fn bare_corrupt_line_has_no_deviations() {
        let text = SAMPLE.replace("@2@commitment_send_invalid_share", "@2");
        let opts: SimulatorOptions = text.parse().unwrap();
        assert_eq!(opts.corrupted[0], (2, vec![]));
    }

    #[test]
    fn malformed_files_abort() {
        assert!("junk".parse::<SimulatorOptions>().is_err());
        // data before any section marker
        assert!("@3".parse::<SimulatorOptions>().is_err());
        // too many sections
        let text = format!("{SAMPLE}# EXTRA\n@1\n");
        assert!(text.parse::<SimulatorOptions>().is_err());
        // unknown scenario
        let text = SAMPLE.replace("commitment_send_invalid_share", "eat_the_shares");
        assert!(text.parse::<SimulatorOptions>().is_err());
        // malformed input line
        let text = SAMPLE.replace("@1@a@3", "@1@a");
        assert!(text.parse::<SimulatorOptions>().is_err());
    }
}
