use std::fmt;
use std::str::FromStr;

use crate::records::error::WriteAuthority;
use crate::records::types::ReadSource;

/// Rollout phase of the legacy blob → mirror table migration.
///
/// Phases are set by operators through configuration; nothing in the store
/// advances them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MigrationPhase {
    LegacyOnly,
    DualWrite,
    CutoverRead,
    MirrorPrimary,
    LegacyRetired,
}

impl MigrationPhase {
    pub const ALL: [Self; 5] = [
        Self::LegacyOnly,
        Self::DualWrite,
        Self::CutoverRead,
        Self::MirrorPrimary,
        Self::LegacyRetired,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::LegacyOnly => "legacy_only",
            Self::DualWrite => "dual_write",
            Self::CutoverRead => "cutover_read",
            Self::MirrorPrimary => "mirror_primary",
            Self::LegacyRetired => "legacy_retired",
        }
    }

    fn ordinal(self) -> usize {
        match self {
            Self::LegacyOnly => 0,
            Self::DualWrite => 1,
            Self::CutoverRead => 2,
            Self::MirrorPrimary => 3,
            Self::LegacyRetired => 4,
        }
    }

    /// One step forward, or one step back to roll out of a bad phase. A blob
    /// that missed a best-effort write stays flagged stale, so writes after a
    /// step back from mirror_primary rebase on the mirror rows. Once the
    /// legacy blob is retired there is no way back.
    pub fn validate_transition(from: Self, to: Self) -> Result<(), String> {
        if from == to {
            return Ok(());
        }
        if from == Self::LegacyRetired {
            return Err(format!(
                "{} is terminal; the legacy blob is no longer maintained",
                from.as_str()
            ));
        }
        if from.ordinal().abs_diff(to.ordinal()) != 1 {
            return Err(format!(
                "cannot move from {} to {}; phases change one step at a time",
                from.as_str(),
                to.as_str()
            ));
        }
        Ok(())
    }
}

impl fmt::Display for MigrationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MigrationPhase {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let normalized = raw.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL
            .iter()
            .copied()
            .find(|phase| phase.as_str() == normalized)
            .ok_or_else(|| raw.trim().to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegacyWrite {
    /// Failure aborts the transaction.
    Required,
    /// Written under a savepoint; failure is logged and tolerated.
    BestEffort,
    Skip,
}

/// Per-request routing decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoutePlan {
    pub phase: MigrationPhase,
    pub read_source: ReadSource,
    /// Representation a patch is applied against.
    pub write_base: ReadSource,
    pub write_mirror: bool,
    pub legacy_write: LegacyWrite,
    pub compare_reads: bool,
}

impl RoutePlan {
    pub fn authority(&self) -> WriteAuthority {
        match self.write_base {
            ReadSource::Legacy => WriteAuthority::Legacy,
            ReadSource::Mirror => WriteAuthority::Mirror,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MigrationRouter {
    phase: MigrationPhase,
    dual_read_compare: bool,
}

impl MigrationRouter {
    pub fn new(phase: MigrationPhase, dual_read_compare: bool) -> Self {
        Self {
            phase,
            dual_read_compare,
        }
    }

    pub fn phase(&self) -> MigrationPhase {
        self.phase
    }

    pub fn plan(&self) -> RoutePlan {
        let (read_source, write_base, write_mirror, legacy_write) = match self.phase {
            MigrationPhase::LegacyOnly => (
                ReadSource::Legacy,
                ReadSource::Legacy,
                false,
                LegacyWrite::Required,
            ),
            MigrationPhase::DualWrite => (
                ReadSource::Legacy,
                ReadSource::Legacy,
                true,
                LegacyWrite::Required,
            ),
            MigrationPhase::CutoverRead => (
                ReadSource::Mirror,
                ReadSource::Legacy,
                true,
                LegacyWrite::Required,
            ),
            MigrationPhase::MirrorPrimary => (
                ReadSource::Mirror,
                ReadSource::Mirror,
                true,
                LegacyWrite::BestEffort,
            ),
            MigrationPhase::LegacyRetired => (
                ReadSource::Mirror,
                ReadSource::Mirror,
                true,
                LegacyWrite::Skip,
            ),
        };
        // Comparison only follows reads served from the legacy blob while the
        // mirror is being written.
        let compare_reads =
            self.dual_read_compare && write_mirror && read_source == ReadSource::Legacy;
        RoutePlan {
            phase: self.phase,
            read_source,
            write_base,
            write_mirror,
            legacy_write,
            compare_reads,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phases_parse_from_config_strings() {
        assert_eq!("dual_write".parse::<MigrationPhase>(), Ok(MigrationPhase::DualWrite));
        assert_eq!(" Mirror-Primary ".parse::<MigrationPhase>(), Ok(MigrationPhase::MirrorPrimary));
        assert_eq!(
            "shadow".parse::<MigrationPhase>(),
            Err("shadow".to_string())
        );
        for phase in MigrationPhase::ALL {
            assert_eq!(phase.as_str().parse::<MigrationPhase>(), Ok(phase));
        }
    }

    #[test]
    fn legacy_only_never_touches_the_mirror() {
        let plan = MigrationRouter::new(MigrationPhase::LegacyOnly, true).plan();
        assert_eq!(plan.read_source, ReadSource::Legacy);
        assert!(!plan.write_mirror);
        assert_eq!(plan.legacy_write, LegacyWrite::Required);
        assert!(!plan.compare_reads);
    }

    #[test]
    fn dual_write_reads_legacy_and_compares() {
        let plan = MigrationRouter::new(MigrationPhase::DualWrite, true).plan();
        assert_eq!(plan.read_source, ReadSource::Legacy);
        assert!(plan.write_mirror);
        assert!(plan.compare_reads);
        assert_eq!(plan.authority(), WriteAuthority::Legacy);

        let quiet = MigrationRouter::new(MigrationPhase::DualWrite, false).plan();
        assert!(!quiet.compare_reads);
    }

    #[test]
    fn cutover_reads_mirror_but_keeps_legacy_authoritative() {
        let plan = MigrationRouter::new(MigrationPhase::CutoverRead, true).plan();
        assert_eq!(plan.read_source, ReadSource::Mirror);
        assert_eq!(plan.write_base, ReadSource::Legacy);
        assert_eq!(plan.legacy_write, LegacyWrite::Required);
        assert!(!plan.compare_reads);
    }

    #[test]
    fn mirror_primary_makes_legacy_best_effort() {
        let plan = MigrationRouter::new(MigrationPhase::MirrorPrimary, true).plan();
        assert_eq!(plan.write_base, ReadSource::Mirror);
        assert_eq!(plan.legacy_write, LegacyWrite::BestEffort);
        assert_eq!(plan.authority(), WriteAuthority::Mirror);

        let retired = MigrationRouter::new(MigrationPhase::LegacyRetired, true).plan();
        assert_eq!(retired.legacy_write, LegacyWrite::Skip);
    }

    #[test]
    fn transitions_move_one_step_and_retirement_is_terminal() {
        use MigrationPhase::*;
        assert!(MigrationPhase::validate_transition(LegacyOnly, DualWrite).is_ok());
        assert!(MigrationPhase::validate_transition(CutoverRead, DualWrite).is_ok());
        assert!(MigrationPhase::validate_transition(MirrorPrimary, LegacyRetired).is_ok());
        assert!(MigrationPhase::validate_transition(LegacyOnly, CutoverRead).is_err());
        assert!(MigrationPhase::validate_transition(LegacyRetired, MirrorPrimary).is_err());
        assert!(MigrationPhase::validate_transition(DualWrite, DualWrite).is_ok());
    }
}
