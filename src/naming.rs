//! Deterministic derivation of commitment ids.
//!
//! Every honest party must produce the same id for the same derived
//! commitment, so all of these are pure string functions of their inputs.
//! Commutative operations canonicalize through a sorted pair.

use crate::error::{Result, SimulationError};
use crate::{CommitmentId, GateNumber, PartyId};

pub const SHARE_PREFIX: &str = "share";
pub const TRIPLE_PREFIX: &str = "triple";
pub const SEPARATOR: char = '@';

pub const POLY_F: &str = "f";
pub const POLY_G: &str = "g";
pub const POLY_H: &str = "h";

/// Triple component tags.
pub const TRIPLE_M1: &str = "first_mul";
pub const TRIPLE_M2: &str = "second_mul";
pub const TRIPLE_E: &str = "e";
pub const TRIPLE_D: &str = "d";
pub const TRIPLE_PROD: &str = "product";

pub fn sorted_pair(cid1: &str, cid2: &str) -> (String, String) {
    if cid1 <= cid2 {
        (cid1.to_string(), cid2.to_string())
    } else {
        (cid2.to_string(), cid1.to_string())
    }
}

pub fn added_commit_id(cid1: &str, cid2: &str) -> CommitmentId {
    let (a, b) = sorted_pair(cid1, cid2);
    format!("_({a}_+_{b})_")
}

pub fn multiplied_commit_id(cid1: &str, cid2: &str) -> CommitmentId {
    let (a, b) = sorted_pair(cid1, cid2);
    format!("_({a}_*_{b})_")
}

/// `scalar` must already be reduced mod p; honest parties then agree on the
/// digits that end up in the id.
pub fn const_mult_commit_id(scalar: u64, cid: &str) -> CommitmentId {
    format!("_({scalar}_._{cid})_")
}

pub fn transferred_commit_id(cid: &str, source: PartyId, target: PartyId) -> CommitmentId {
    format!("_(transfered_{cid}_{source}-->{target})_")
}

pub fn coeff_commit_id_for_sharing(cid: &str, coeff: usize) -> CommitmentId {
    format!("_({cid}_share_coeff_{coeff})_")
}

pub fn coeff_commit_id_for_transfer(
    cid: &str,
    source: PartyId,
    target: PartyId,
    coeff: usize,
) -> CommitmentId {
    format!("_({cid}_trans_coeff_{source}_{target}_{coeff})_")
}

pub fn coeff_commit_id_for_mult(
    poly_name: &str,
    cid1: &str,
    cid2: &str,
    coeff: usize,
) -> CommitmentId {
    let (a, b) = sorted_pair(cid1, cid2);
    format!("_({a}_mult_coeff_{b}_{poly_name}{coeff})_")
}

/// Share names follow `share(flags)@distributor@receiver@suffix`; a
/// distributor of 0 marks a locally assigned (wire result) share. The
/// suffix must be something all honest parties agree on, like an input
/// sharing round or a gate number.
pub fn make_share_name(
    distributor: PartyId,
    receiver: PartyId,
    suffix: &str,
    input: bool,
    mul_triple: bool,
    assigned: bool,
) -> CommitmentId {
    let mut prefix = String::from(SHARE_PREFIX);
    if input {
        prefix.push_str("(input)");
    }
    if mul_triple {
        prefix.push_str("(multiplication_triple)");
    }
    if assigned {
        prefix.push_str("(assigned)");
    }
    make_share_name_with_prefix(&prefix, distributor, receiver, suffix)
}

pub fn make_share_name_with_prefix(
    prefix: &str,
    distributor: PartyId,
    receiver: PartyId,
    suffix: &str,
) -> CommitmentId {
    format!("{prefix}{SEPARATOR}{distributor}{SEPARATOR}{receiver}{SEPARATOR}{suffix}")
}

pub struct ShareName {
    pub prefix: String,
    pub distributor: PartyId,
    pub receiver: PartyId,
    pub suffix: String,
}

pub fn split_share_name(cid: &str) -> Result<ShareName> {
    let tokens: Vec<&str> = cid.split(SEPARATOR).collect();
    if tokens.len() != 4 {
        return Err(SimulationError::Invariant(format!(
            "malformed share name: {cid}"
        )));
    }
    let distributor = tokens[1]
        .parse()
        .map_err(|_| SimulationError::Invariant(format!("malformed share name: {cid}")))?;
    let receiver = tokens[2]
        .parse()
        .map_err(|_| SimulationError::Invariant(format!("malformed share name: {cid}")))?;
    Ok(ShareName {
        prefix: tokens[0].to_string(),
        distributor,
        receiver,
        suffix: tokens[3].to_string(),
    })
}

pub fn make_triple_name(owner: PartyId, kind: &str, gate: GateNumber) -> CommitmentId {
    format!("{TRIPLE_PREFIX}{SEPARATOR}{owner}{SEPARATOR}{kind}{SEPARATOR}{gate}")
}

/// User-chosen commit ids must stay out of the reserved name spaces.
pub fn is_reserved(cid: &str) -> bool {
    cid.starts_with(SHARE_PREFIX) || cid.starts_with(TRIPLE_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commutative_ids_are_order_independent() {
        assert_eq!(added_commit_id("x", "y"), added_commit_id("y", "x"));
        assert_eq!(added_commit_id("x", "y"), "_(x_+_y)_");
        assert_eq!(multiplied_commit_id("b", "a"), "_(a_*_b)_");
        assert_eq!(
            coeff_commit_id_for_mult(POLY_H, "m", "k", 2),
            coeff_commit_id_for_mult(POLY_H, "k", "m", 2)
        );
    }

    #[test]
    fn canonical_forms() {
        assert_eq!(const_mult_commit_id(7, "c"), "_(7_._c)_");
        assert_eq!(transferred_commit_id("c", 1, 3), "_(transfered_c_1-->3)_");
        assert_eq!(coeff_commit_id_for_sharing("c", 1), "_(c_share_coeff_1)_");
        assert_eq!(
            coeff_commit_id_for_transfer("c", 2, 3, 1),
            "_(c_trans_coeff_2_3_1)_"
        );
        assert_eq!(
            coeff_commit_id_for_mult(POLY_F, "a", "b", 1),
            "_(a_mult_coeff_b_f1)_"
        );
    }

    #[test]
    fn share_names_round_trip() {
        let name = make_share_name(2, 3, "0", true, false, false);
        assert_eq!(name, "share(input)@2@3@0");
        let parts = split_share_name(&name).unwrap();
        assert_eq!(parts.prefix, "share(input)");
        assert_eq!(parts.distributor, 2);
        assert_eq!(parts.receiver, 3);
        assert_eq!(parts.suffix, "0");
        let renamed = make_share_name_with_prefix(&parts.prefix, parts.distributor, 1, &parts.suffix);
        assert_eq!(renamed, "share(input)@2@1@0");
    }

    #[test]
    fn malformed_share_names_are_rejected() {
        assert!(split_share_name("share@1@2").is_err());
        assert!(split_share_name("share@x@2@0").is_err());
    }

    #[test]
    fn reserved_prefixes() {
        assert!(is_reserved("share(input)@1@2@0"));
        assert!(is_reserved("triple@1@e@4"));
        assert!(!is_reserved("party1_commitment_4"));
        assert_eq!(make_triple_name(2, TRIPLE_E, 4), "triple@2@e@4");
    }
}
