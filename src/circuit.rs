use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::error::{Result, SimulationError};
use crate::field::Field;
use crate::{CommitmentId, GateNumber};

pub type GateId = usize;
pub type WireId = usize;

/// The per-gate behaviour is a pure function of this tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateKind {
    Add,
    /// Multiplication by a literal constant; may be negative until it is
    /// reduced into the field.
    ConstMult(i64),
    Mult,
}

/// A wire carries either a field value (CEPS) or a commitment id (CEAS).
/// Gates reference wires by arena index; a wire knows the gate feeding it
/// and the gate it feeds, if any.
#[derive(Debug, Clone, Default)]
pub struct Wire {
    value: Option<u64>,
    cid: Option<CommitmentId>,
    assigned: bool,
    prev: Option<GateId>,
    next: Option<GateId>,
    input_label: Option<String>,
}

impl Wire {
    fn labeled(label: &str) -> Wire {
        Wire {
            input_label: Some(label.to_string()),
            ..Wire::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct Gate {
    number: GateNumber,
    kind: GateKind,
    inputs: Vec<WireId>,
    outputs: Vec<WireId>,
}

impl Gate {
    pub fn number(&self) -> GateNumber {
        self.number
    }

    pub fn kind(&self) -> GateKind {
        self.kind
    }

    fn max_inputs(&self) -> usize {
        match self.kind {
            GateKind::ConstMult(_) => 1,
            _ => 2,
        }
    }
}

/// An arithmetic circuit: gate and wire arenas plus the connection graph.
/// The circuit owns both arenas; wires and gates never own each other.
#[derive(Debug, Clone, Default)]
pub struct Circuit {
    gates: Vec<Gate>,
    wires: Vec<Wire>,
}

impl Circuit {
    pub fn gate(&self, g: GateId) -> &Gate {
        &self.gates[g]
    }

    pub fn gate_count(&self) -> usize {
        self.gates.len()
    }

    /// Gate numbers of every multiplication gate, in gate-number order.
    pub fn mult_gate_numbers(&self) -> Vec<GateNumber> {
        let mut numbers: Vec<GateNumber> = self
            .gates
            .iter()
            .filter(|g| g.kind == GateKind::Mult)
            .map(|g| g.number)
            .collect();
        numbers.sort_unstable();
        numbers
    }

    fn is_ready(&self, g: GateId) -> bool {
        self.gates[g].inputs.iter().all(|&w| self.wires[w].assigned)
    }

    fn is_processed(&self, g: GateId) -> bool {
        // all output wires are assigned together, so checking one is enough
        match self.gates[g].outputs.last() {
            Some(&w) => self.wires[w].assigned,
            None => false,
        }
    }

    /// The ready-but-unprocessed gate with the smallest gate number.
    /// Honest parties must process gates in the same order, and this rule
    /// is deterministic.
    pub fn next_ready(&self) -> Option<GateId> {
        (0..self.gates.len())
            .filter(|&g| !self.is_processed(g) && self.is_ready(g))
            .min_by_key(|&g| self.gates[g].number)
    }

    /// Number of required inputs. This may differ from the number of open
    /// input wires because one label may feed several wires.
    pub fn input_count(&self) -> usize {
        self.labels().len()
    }

    pub fn labels(&self) -> BTreeSet<String> {
        self.wires
            .iter()
            .filter(|w| w.prev.is_none())
            .filter_map(|w| w.input_label.clone())
            .collect()
    }

    /// Number of open output wires.
    pub fn output_count(&self) -> usize {
        self.wires
            .iter()
            .filter(|w| w.prev.is_some() && w.next.is_none())
            .count()
    }

    pub fn assign_input(&mut self, val: u64, label: &str) -> Result<()> {
        let mut assigned = false;
        for w in &mut self.wires {
            if w.prev.is_none() && !w.assigned && w.input_label.as_deref() == Some(label) {
                w.value = Some(val);
                w.assigned = true;
                assigned = true; // keep going, the label may occur again
            }
        }
        if assigned {
            Ok(())
        } else {
            Err(SimulationError::Input(format!(
                "no unassigned input wire with label {label}"
            )))
        }
    }

    pub fn assign_input_cid(&mut self, cid: &str, label: &str) -> Result<()> {
        let mut assigned = false;
        for w in &mut self.wires {
            if w.prev.is_none() && !w.assigned && w.input_label.as_deref() == Some(label) {
                w.cid = Some(cid.to_string());
                w.assigned = true;
                assigned = true;
            }
        }
        if assigned {
            Ok(())
        } else {
            Err(SimulationError::Input(format!(
                "no unassigned input wire with label {label}"
            )))
        }
    }

    /// The result lands on every output wire of the gate and on the input
    /// wires of the gates those feed.
    pub fn assign_result(&mut self, g: GateId, val: u64) {
        for oi in self.gates[g].outputs.clone() {
            self.wires[oi].value = Some(val);
            self.wires[oi].assigned = true;
            if let Some(ng) = self.wires[oi].next {
                for ii in self.gates[ng].inputs.clone() {
                    if self.wires[ii].prev == Some(g) {
                        self.wires[ii].value = Some(val);
                        self.wires[ii].assigned = true;
                    }
                }
            }
        }
    }

    pub fn assign_result_cid(&mut self, g: GateId, cid: &str) {
        for oi in self.gates[g].outputs.clone() {
            self.wires[oi].cid = Some(cid.to_string());
            self.wires[oi].assigned = true;
            if let Some(ng) = self.wires[oi].next {
                for ii in self.gates[ng].inputs.clone() {
                    if self.wires[ii].prev == Some(g) {
                        self.wires[ii].cid = Some(cid.to_string());
                        self.wires[ii].assigned = true;
                    }
                }
            }
        }
    }

    pub fn input_values(&self, g: GateId) -> Result<Vec<u64>> {
        self.gates[g]
            .inputs
            .iter()
            .map(|&w| {
                self.wires[w]
                    .value
                    .ok_or_else(|| SimulationError::Invariant("gate input has no value".into()))
            })
            .collect()
    }

    pub fn input_cids(&self, g: GateId) -> Result<Vec<CommitmentId>> {
        self.gates[g]
            .inputs
            .iter()
            .map(|&w| {
                self.wires[w].cid.clone().ok_or_else(|| {
                    SimulationError::Invariant("wire is assigned no commitment".into())
                })
            })
            .collect()
    }

    /// Local computation of a gate from its input values, reduced mod p.
    pub fn local_compute(&self, f: Field, g: GateId) -> Result<u64> {
        let vals = self.input_values(g)?;
        Ok(match self.gates[g].kind {
            GateKind::Add => f.add(vals[0], vals[1]),
            GateKind::ConstMult(c) => f.mul(vals[0], f.reduce_signed(c)),
            GateKind::Mult => f.mul(vals[0], vals[1]),
        })
    }

    fn output_gate(&self) -> Result<GateId> {
        for g in 0..self.gates.len() {
            if !self.is_processed(g) {
                return Err(SimulationError::Invariant(
                    "there are unprocessed gates".into(),
                ));
            }
        }
        for (g, gate) in self.gates.iter().enumerate() {
            if gate.outputs.iter().any(|&w| self.wires[w].next.is_none()) {
                return Ok(g);
            }
        }
        Err(SimulationError::Circuit("no output gate".into()))
    }

    /// Evaluation result from the free output wire, copied out.
    pub fn retrieve_output(&self) -> Result<u64> {
        let g = self.output_gate()?;
        for &w in &self.gates[g].outputs {
            if self.wires[w].next.is_none() {
                return self.wires[w]
                    .value
                    .ok_or_else(|| SimulationError::Invariant("output wire has no value".into()));
            }
        }
        unreachable!("output gate always has a free output wire")
    }

    pub fn retrieve_output_cid(&self) -> Result<CommitmentId> {
        let g = self.output_gate()?;
        for &w in &self.gates[g].outputs {
            if self.wires[w].next.is_none() {
                return self.wires[w].cid.clone().ok_or_else(|| {
                    SimulationError::Invariant("output wire has no commitment".into())
                });
            }
        }
        unreachable!("output gate always has a free output wire")
    }

    // circuit construction

    fn add_gate(&mut self, number: GateNumber, kind: GateKind) -> GateId {
        self.gates.push(Gate {
            number,
            kind,
            inputs: Vec::new(),
            outputs: Vec::new(),
        });
        self.gates.len() - 1
    }

    fn add_wire(&mut self, wire: Wire) -> WireId {
        self.wires.push(wire);
        self.wires.len() - 1
    }

    fn add_input_wire(&mut self, g: GateId, w: WireId) -> Result<()> {
        self.wires[w].next = Some(g);
        self.gates[g].inputs.push(w);
        if self.gates[g].inputs.len() > self.gates[g].max_inputs() {
            return Err(SimulationError::Circuit(
                "more input wires than allowed".into(),
            ));
        }
        Ok(())
    }

    fn add_output_wire(&mut self, g: GateId, w: WireId) {
        self.wires[w].prev = Some(g);
        self.gates[g].outputs.push(w);
    }

    fn empty_output_wire(&self, g: GateId) -> Option<WireId> {
        self.gates[g]
            .outputs
            .iter()
            .copied()
            .find(|&w| self.wires[w].next.is_none())
    }

    fn empty_input_wire(&self, g: GateId) -> Option<WireId> {
        self.gates[g]
            .inputs
            .iter()
            .copied()
            .find(|&w| self.wires[w].prev.is_none() && self.wires[w].input_label.is_none())
    }

    fn input_wire_with_label(&self, g: GateId, label: &str) -> Option<WireId> {
        self.gates[g].inputs.iter().copied().find(|&w| {
            self.wires[w].prev.is_none() && self.wires[w].input_label.as_deref() == Some(label)
        })
    }

    /// g1 --> g2, reusing dangling wires where possible.
    fn connect_gates(&mut self, g1: GateId, g2: GateId) -> Result<()> {
        if g1 == g2 {
            return Err(SimulationError::Circuit(
                "tried to connect gate to itself".into(),
            ));
        }
        let out = match self.empty_output_wire(g1) {
            Some(w) => w,
            None => {
                let w = self.add_wire(Wire::default());
                self.add_output_wire(g1, w);
                w
            }
        };
        self.wires[out].next = Some(g2);
        let inp = match self.empty_input_wire(g2) {
            Some(w) => w,
            None => {
                let w = self.add_wire(Wire::default());
                self.add_input_wire(g2, w)?;
                w
            }
        };
        self.wires[inp].prev = Some(g1);
        Ok(())
    }

    /// g1 --> the input wire of g2 carrying the given (welding) label.
    fn connect_gate_to_label(&mut self, g1: GateId, g2: GateId, label: &str) -> Result<()> {
        let out = match self.empty_output_wire(g1) {
            Some(w) => w,
            None => {
                let w = self.add_wire(Wire::default());
                self.add_output_wire(g1, w);
                w
            }
        };
        self.wires[out].next = Some(g2);
        let inp = self
            .input_wire_with_label(g2, label)
            .ok_or_else(|| SimulationError::Circuit(format!("no wire with label {label}")))?;
        self.wires[inp].prev = Some(g1);
        Ok(())
    }

    /// Absorbs `part`, renumbering its gates to continue this circuit's
    /// numbering. Returns the gate-id offset of the absorbed part.
    fn merge(&mut self, part: Circuit) -> GateId {
        let gate_offset = self.gates.len();
        let wire_offset = self.wires.len();
        for mut wire in part.wires {
            wire.prev = wire.prev.map(|g| g + gate_offset);
            wire.next = wire.next.map(|g| g + gate_offset);
            self.wires.push(wire);
        }
        for mut gate in part.gates {
            gate.number = self.gates.len() + 1;
            for w in &mut gate.inputs {
                *w += wire_offset;
            }
            for w in &mut gate.outputs {
                *w += wire_offset;
            }
            self.gates.push(gate);
        }
        gate_offset
    }

    /// Builds the circuit described by the expression grammar:
    ///
    /// ```text
    /// expression := term ('+' term)*
    /// term       := factor (('*' factor) | ('.' number))*
    /// factor     := label | '(' expression ')'
    /// ```
    pub fn parse(description: &str) -> Result<Circuit> {
        Circuit::parse_with_top(description).map(|(c, _)| c)
    }

    /// Like `parse`, but also reports the top-level expression gate, which
    /// is the output gate of the parsed circuit (None for a bare label).
    fn parse_with_top(description: &str) -> Result<(Circuit, Option<GateId>)> {
        if description.is_empty() {
            return Err(SimulationError::Circuit("empty description string".into()));
        }
        for ch in description.chars() {
            let ok = ch.is_ascii_lowercase()
                || ch.is_ascii_digit()
                || matches!(ch, '+' | '*' | '.' | '-' | '(' | ')');
            if !ok {
                return Err(SimulationError::Circuit(format!(
                    "unexpected character: {ch}"
                )));
            }
        }
        let mut parser = Parser {
            circuit: Circuit::default(),
            bytes: description.as_bytes(),
            pos: 0,
            saved_input: None,
            next_number: 1,
        };
        let top = parser.expression()?;
        if parser.pos != parser.bytes.len() {
            return Err(SimulationError::Circuit(format!(
                "trailing input at offset {}",
                parser.pos
            )));
        }
        Ok((parser.circuit, top))
    }

    /// A circuit comparing the bit representations of two values `a` and
    /// `b`; evaluates to 1 iff a > b. The circuit expects inputs labelled
    /// `<a>0..<a>l`, `<b>0..<b>l` and `<one>` (which must be fed 1).
    ///
    /// Structure: per-bit XOR gadgets feed a most-significant-one detector
    /// f_l..f_0, and the output is the sum over a_i * (f_{i+1} - f_i).
    pub fn comparator(
        bitlength: u32,
        label_a: &str,
        label_b: &str,
        label_one: &str,
    ) -> Result<Circuit> {
        if bitlength == 0 {
            return Err(SimulationError::Circuit("bad bitlength".into()));
        }
        // welding labels; internal only, never fed by a secret
        const C: &str = "c";
        const FIP1: &str = "fiplusone";
        const FI: &str = "fi";
        const OMC_MUL: &str = "omcmul";
        const D: &str = "d";
        const ADD_UP: &str = "addup";
        const ADD_DOWN: &str = "adddown";

        let l = (bitlength - 1) as i64;
        let mut c = Circuit::default();
        // the top-level expression gate of a parsed description is its
        // output gate, so remember it across the merge
        let sub = |c: &mut Circuit, desc: &str| -> Result<GateId> {
            let (part, top) = Circuit::parse_with_top(desc)?;
            let top = top.ok_or_else(|| SimulationError::Circuit("gateless part".into()))?;
            let offset = c.merge(part);
            Ok(offset + top)
        };

        let mut prev_mul: Option<GateId> = None;
        let mut df_arr: Vec<GateId> = vec![0; bitlength as usize];
        for i in (0..=l).rev() {
            let la = format!("{label_a}{i}");
            let lb = format!("{label_b}{i}");
            let xor = sub(&mut c, &format!("({la}+{lb}+({la}*{lb}).-2)"))?;
            let omc = sub(&mut c, &format!("({label_one}+({C}.-1))"))?;
            let (df, mul);
            if i == l {
                df = sub(&mut c, &format!("({label_one}+({FI}.-1))"))?;
                mul = sub(&mut c, &format!("({label_one}*{OMC_MUL})"))?;
            } else {
                df = sub(&mut c, &format!("({FIP1}+({FI}.-1))"))?;
                mul = sub(&mut c, &format!("({FIP1}*{OMC_MUL})"))?;
                let prev = prev_mul.expect("set on the first iteration");
                c.connect_gate_to_label(prev, mul, FIP1)?;
                c.connect_gate_to_label(prev, df, FIP1)?;
            }
            c.connect_gate_to_label(xor, omc, C)?;
            c.connect_gate_to_label(omc, mul, OMC_MUL)?;
            c.connect_gate_to_label(mul, df, FI)?;
            prev_mul = Some(mul);
            df_arr[i as usize] = df;
        }
        let mut prev_add: Option<GateId> = None;
        for i in (0..=l).rev() {
            let la = format!("{label_a}{i}");
            let mul = sub(&mut c, &format!("({la}*{D})"))?;
            c.connect_gate_to_label(df_arr[i as usize], mul, D)?;
            match prev_add {
                None => {
                    let add = sub(&mut c, &format!("({ADD_UP}+{ADD_DOWN})"))?;
                    c.connect_gate_to_label(mul, add, ADD_UP)?;
                    prev_add = Some(add);
                }
                Some(add) => {
                    c.connect_gate_to_label(mul, add, ADD_DOWN)?;
                    if i != 0 {
                        let next = sub(&mut c, &format!("({ADD_UP}+{ADD_DOWN})"))?;
                        c.connect_gate_to_label(add, next, ADD_UP)?;
                        prev_add = Some(next);
                    }
                }
            }
        }
        Ok(c)
    }
}

impl FromStr for Circuit {
    type Err = SimulationError;

    fn from_str(s: &str) -> Result<Circuit> {
        Circuit::parse(s)
    }
}

impl fmt::Display for Circuit {
    fn fmt(&self, out: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(out, "{{")?;
        for g in &self.gates {
            let kind = match g.kind {
                GateKind::Add => "+".to_string(),
                GateKind::ConstMult(c) => format!(".{c}"),
                GateKind::Mult => "*".to_string(),
            };
            let ins: Vec<String> = g
                .inputs
                .iter()
                .map(|&w| match (&self.wires[w].prev, &self.wires[w].input_label) {
                    (Some(p), _) => format!("g{}", self.gates[*p].number),
                    (None, Some(l)) => l.clone(),
                    _ => "?".to_string(),
                })
                .collect();
            writeln!(out, "    [{} | {} {}]", g.number, kind, ins.join(" "))?;
        }
        write!(out, "}}")
    }
}

/// Simple recursive descent parser over the expression grammar. Numbers
/// only occur after `.`; labels are lowercase alphanumerics starting with
/// a letter; symbols are consumed left to right, so parentheses order the
/// MUL and CMUL gates.
struct Parser<'a> {
    circuit: Circuit,
    bytes: &'a [u8],
    pos: usize,
    saved_input: Option<WireId>,
    next_number: GateNumber,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> u8 {
        self.bytes.get(self.pos).copied().unwrap_or(0)
    }

    fn get(&mut self) -> u8 {
        let b = self.peek();
        self.pos += 1;
        b
    }

    fn next_gate_number(&mut self) -> GateNumber {
        let n = self.next_number;
        self.next_number += 1;
        n
    }

    fn take_saved_input(&mut self) -> Result<WireId> {
        self.saved_input
            .take()
            .ok_or_else(|| SimulationError::Circuit("no saved input wire".into()))
    }

    fn number(&mut self) -> Result<i64> {
        let negative = self.peek() == b'-';
        if negative {
            self.get();
        }
        if !self.peek().is_ascii_digit() {
            return Err(SimulationError::Circuit("expected a number".into()));
        }
        let mut result: i64 = 0;
        while self.peek().is_ascii_digit() {
            result = result * 10 + i64::from(self.get() - b'0');
        }
        Ok(if negative { -result } else { result })
    }

    fn label(&mut self) -> WireId {
        let mut label = String::new();
        while self.peek().is_ascii_lowercase() || self.peek().is_ascii_digit() {
            label.push(self.get() as char);
        }
        self.circuit.add_wire(Wire::labeled(&label))
    }

    fn factor(&mut self) -> Result<Option<GateId>> {
        match self.peek() {
            b'0'..=b'9' => Err(SimulationError::Circuit("numbers can only follow .".into())),
            b'a'..=b'z' => {
                let w = self.label();
                self.saved_input = Some(w);
                Ok(None)
            }
            b'(' => {
                self.get();
                let g = self.expression()?;
                if self.get() != b')' {
                    return Err(SimulationError::Circuit("unbalanced parenthesis".into()));
                }
                Ok(g)
            }
            other => Err(SimulationError::Circuit(format!(
                "unexpected character: {}",
                other as char
            ))),
        }
    }

    fn attach_operand(&mut self, operand: Option<GateId>, g: GateId) -> Result<()> {
        match operand {
            None => {
                let w = self.take_saved_input()?;
                self.circuit.add_input_wire(g, w)
            }
            Some(src) => self.circuit.connect_gates(src, g),
        }
    }

    fn term(&mut self) -> Result<Option<GateId>> {
        let mut g1 = self.factor()?;
        while self.peek() == b'*' || self.peek() == b'.' {
            let g = if self.get() == b'*' {
                let n = self.next_gate_number();
                let g = self.circuit.add_gate(n, GateKind::Mult);
                let w = self.circuit.add_wire(Wire::default());
                self.circuit.add_output_wire(g, w);
                self.attach_operand(g1, g)?;
                let g2 = self.factor()?;
                self.attach_operand(g2, g)?;
                g
            } else {
                let scalar = self.number()?;
                let n = self.next_gate_number();
                let g = self.circuit.add_gate(n, GateKind::ConstMult(scalar));
                let w = self.circuit.add_wire(Wire::default());
                self.circuit.add_output_wire(g, w);
                self.attach_operand(g1, g)?;
                g
            };
            g1 = Some(g);
        }
        Ok(g1)
    }

    fn expression(&mut self) -> Result<Option<GateId>> {
        let mut g1 = self.term()?;
        while self.peek() == b'+' {
            self.get();
            let n = self.next_gate_number();
            let g = self.circuit.add_gate(n, GateKind::Add);
            let w = self.circuit.add_wire(Wire::default());
            self.circuit.add_output_wire(g, w);
            self.attach_operand(g1, g)?;
            let g2 = self.term()?;
            self.attach_operand(g2, g)?;
            g1 = Some(g);
        }
        Ok(g1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    /// Evaluate a circuit in the clear by running the gate loop locally.
    fn evaluate(c: &mut Circuit, f: Field, inputs: &[(&str, u64)]) -> u64 {
        let labels = c.labels();
        for (label, val) in inputs {
            if labels.contains(*label) {
                c.assign_input(*val, label).unwrap();
            }
        }
        while let Some(g) = c.next_ready() {
            let v = c.local_compute(f, g).unwrap();
            c.assign_result(g, v);
        }
        c.retrieve_output().unwrap()
    }

    #[test]
    fn parses_the_reference_circuit() {
        let f = Field::new(2039);
        let mut c = Circuit::parse("(a+b)*(c.2)").unwrap();
        assert_eq!(c.input_count(), 3);
        assert_eq!(c.output_count(), 1);
        assert_eq!(evaluate(&mut c, f, &[("a", 3), ("b", 5), ("c", 7)]), 112);
    }

    #[test]
    fn repeated_labels_bind_to_one_secret() {
        let f = Field::new(2039);
        let mut c = Circuit::parse("(foo+b).2*c*(foo*c)").unwrap();
        assert_eq!(c.input_count(), 3);
        // ((4+1)*2) * 3 * (4*3) = 360
        assert_eq!(evaluate(&mut c, f, &[("foo", 4), ("b", 1), ("c", 3)]), 360);
    }

    #[test]
    fn negative_constants_reduce_into_the_field() {
        let f = Field::new(257);
        let mut c = Circuit::parse("a.-2+b").unwrap();
        assert_eq!(evaluate(&mut c, f, &[("a", 3), ("b", 10)]), 4);
    }

    #[test]
    fn gate_order_follows_numbering() {
        let c = Circuit::parse("(a+b)*(c.2)").unwrap();
        // add is numbered 1, mult 2, cmult 3; the first ready gate is the add
        let first = c.next_ready().unwrap();
        assert_eq!(c.gate(first).kind(), GateKind::Add);
        assert_eq!(c.gate(first).number(), 1);
    }

    #[test]
    fn rejects_malformed_descriptions() {
        assert!(Circuit::parse("").is_err());
        assert!(Circuit::parse("a+B").is_err());
        assert!(Circuit::parse("2a").is_err());
        assert!(Circuit::parse("(a+b").is_err());
        assert!(Circuit::parse("a+b)").is_err());
    }

    #[test]
    fn single_output_invariant_holds_for_parsed_circuits() {
        for desc in ["(a+b)*(c.2)", "a*b", "(x+y)*(x+z)*(y.3)"] {
            assert_eq!(Circuit::parse(desc).unwrap().output_count(), 1, "{desc}");
        }
    }

    fn comparator_result(f: Field, bits: u32, a: u64, b: u64) -> u64 {
        let mut c = Circuit::comparator(bits, "a", "b", "one").unwrap();
        let mut inputs: HashMap<String, u64> = HashMap::new();
        for i in 0..bits {
            inputs.insert(format!("a{i}"), (a >> i) & 1);
            inputs.insert(format!("b{i}"), (b >> i) & 1);
        }
        inputs.insert("one".into(), 1);
        let pairs: Vec<(&str, u64)> = inputs.iter().map(|(k, v)| (k.as_str(), *v)).collect();
        evaluate(&mut c, f, &pairs)
    }

    #[test]
    fn comparator_detects_greater_than() {
        let f = Field::new(257);
        assert_eq!(comparator_result(f, 3, 5, 3), 1);
        assert_eq!(comparator_result(f, 3, 3, 5), 0);
        assert_eq!(comparator_result(f, 3, 4, 4), 0);
        for a in 0..8 {
            for b in 0..8 {
                let expect = u64::from(a > b);
                assert_eq!(comparator_result(f, 3, a, b), expect, "a={a} b={b}");
            }
        }
    }

    #[test]
    fn comparator_declares_expected_labels() {
        let c = Circuit::comparator(2, "a", "b", "one").unwrap();
        let labels = c.labels();
        for l in ["a0", "a1", "b0", "b1", "one"] {
            assert!(labels.contains(l), "missing {l}");
        }
        assert_eq!(labels.len(), 5);
        assert_eq!(c.output_count(), 1);
    }
}
