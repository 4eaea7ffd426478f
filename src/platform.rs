/// Platform flags reported by the agent at enrollment time as a
/// bitmask. The values follow the osquery platform encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Posix,   // darwin or freebsd or linux
    Windows, // any Windows desktop or server host
    Linux,   // any RedHat or Debian-based host
    Darwin,  // macOS hosts
    Freebsd, // FreeBSD hosts
}

impl Platform {
    pub const ALL: [Platform; 5] = [
        Platform::Posix,
        Platform::Windows,
        Platform::Linux,
        Platform::Darwin,
        Platform::Freebsd,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Posix => "posix",
            Platform::Windows => "windows",
            Platform::Linux => "linux",
            Platform::Darwin => "darwin",
            Platform::Freebsd => "freebsd",
        }
    }

    pub fn mask_bit(&self) -> u32 {
        match self {
            Platform::Posix => 0x01,
            Platform::Windows => 0x02,
            Platform::Linux => 0x08,
            Platform::Darwin => 0x10,
            Platform::Freebsd => 0x20,
        }
    }

    pub fn from_mask(mask: u32) -> Vec<Platform> {
        Self::ALL
            .iter()
            .copied()
            .filter(|p| p.mask_bit() & mask != 0)
            .collect()
    }

    /// Platform names decoded from a machine's platform mask, the form
    /// used when matching against a query's platform list.
    pub fn names_from_mask(mask: u32) -> Vec<&'static str> {
        Self::from_mask(mask).iter().map(|p| p.as_str()).collect()
    }
}

/// Splits a comma-separated platform list as stored on queries. An
/// empty string means "all platforms".
pub fn parse_platform_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_decoding() {
        assert_eq!(Platform::from_mask(0), vec![]);
        assert_eq!(Platform::from_mask(0x10), vec![Platform::Darwin]);
        // 0x09 = posix | linux, the typical linux agent mask
        assert_eq!(Platform::names_from_mask(0x09), vec!["posix", "linux"]);
        // 0x17 = posix | windows | darwin (unknown bits ignored)
        assert_eq!(
            Platform::names_from_mask(0x17),
            vec!["posix", "windows", "darwin"]
        );
    }

    #[test]
    fn platform_list_parsing() {
        assert!(parse_platform_list("").is_empty());
        assert_eq!(parse_platform_list("darwin"), vec!["darwin"]);
        assert_eq!(
            parse_platform_list("darwin, linux,"),
            vec!["darwin", "linux"]
        );
    }
}
