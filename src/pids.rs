//! Helpers for PDG Monte-Carlo particle IDs.

/// Given `pid` in the PDG convention, return the charge-conjugated particle ID.
#[must_use]
pub const fn charge_conjugate_pdg_pid(pid: i32) -> i32 {
    match pid {
        // neutral particles are their own anti-particles
        21 | 22 | 23 | 25 => pid,
        _ => -pid,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn charge_conjugation() {
        assert_eq!(charge_conjugate_pdg_pid(2), -2);
        assert_eq!(charge_conjugate_pdg_pid(-1), 1);
        assert_eq!(charge_conjugate_pdg_pid(21), 21);
        assert_eq!(charge_conjugate_pdg_pid(22), 22);
        assert_eq!(charge_conjugate_pdg_pid(23), 23);
        assert_eq!(charge_conjugate_pdg_pid(25), 25);
        assert_eq!(charge_conjugate_pdg_pid(2212), -2212);
    }
}
