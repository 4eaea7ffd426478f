/// Agent version as an ordered tuple. Version strings have one to
/// four dot-separated numeric components; missing components compare
/// as zero, and a missing or unparsable version is (0,0,0,0), which
/// fails any non-zero minimum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct AgentVersion([u32; 4]);

impl AgentVersion {
    pub const ZERO: AgentVersion = AgentVersion([0; 4]);

    pub fn parse(s: &str) -> Option<AgentVersion> {
        let mut parts = [0u32; 4];
        let mut count = 0;
        for piece in s.trim().split('.') {
            if count == 4 {
                return None;
            }
            parts[count] = piece.parse().ok()?;
            count += 1;
        }
        if count == 0 {
            return None;
        }
        Some(AgentVersion(parts))
    }

    pub fn parse_or_zero(s: Option<&str>) -> AgentVersion {
        s.and_then(AgentVersion::parse).unwrap_or(AgentVersion::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_versions() {
        assert_eq!(AgentVersion::parse("5.0.1"), Some(AgentVersion([5, 0, 1, 0])));
        assert_eq!(AgentVersion::parse("5"), Some(AgentVersion([5, 0, 0, 0])));
        assert_eq!(
            AgentVersion::parse("4.9.9.2"),
            Some(AgentVersion([4, 9, 9, 2]))
        );
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(AgentVersion::parse(""), None);
        assert_eq!(AgentVersion::parse("abc"), None);
        assert_eq!(AgentVersion::parse("5.0.x"), None);
        assert_eq!(AgentVersion::parse("1.2.3.4.5"), None);
    }

    #[test]
    fn missing_version_is_zero() {
        assert_eq!(AgentVersion::parse_or_zero(None), AgentVersion::ZERO);
        assert_eq!(AgentVersion::parse_or_zero(Some("junk")), AgentVersion::ZERO);
    }

    #[test]
    fn ordering_matches_version_semantics() {
        let v499 = AgentVersion::parse("4.9.9").unwrap();
        let v500 = AgentVersion::parse("5.0.0").unwrap();
        let v510 = AgentVersion::parse("5.1.0").unwrap();
        assert!(v499 < v500);
        assert!(v500 <= v500);
        assert!(v500 < v510);
        assert!(AgentVersion::ZERO < v499);
    }
}
