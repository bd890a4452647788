//! IP blocklist applied before any outbound connection.
//!
//! Plain-text format, one rule per line: `a.b.c.d - e.f.g.h` ranges, CIDR
//! blocks or single addresses, IPv4 or IPv6. `#` starts a comment.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};

/// Errors that occur while loading a blocklist.
#[derive(Debug, thiserror::Error)]
pub enum BlocklistError {
    #[error("Failed to read blocklist {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Blocklist line {line}: {reason}")]
    InvalidRule { line: usize, reason: String },
}

/// Set of blocked address ranges.
#[derive(Debug, Default, Clone)]
pub struct Blocklist {
    v4: Vec<(u32, u32)>,
    v6: Vec<(u128, u128)>,
}

impl Blocklist {
    /// Reads and parses a blocklist file.
    ///
    /// # Errors
    ///
    /// - `BlocklistError::Read` - File missing or unreadable
    /// - `BlocklistError::InvalidRule` - Malformed line
    pub async fn load(path: &Path) -> Result<Self, BlocklistError> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| BlocklistError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        let blocklist = Self::parse(&text)?;
        tracing::info!(
            "Loaded blocklist {} with {} rules",
            path.display(),
            blocklist.len()
        );
        Ok(blocklist)
    }

    /// Parses blocklist text.
    ///
    /// # Errors
    ///
    /// - `BlocklistError::InvalidRule` - Malformed line, numbered from 1
    pub fn parse(text: &str) -> Result<Self, BlocklistError> {
        let mut blocklist = Self::default();
        for (index, raw) in text.lines().enumerate() {
            let line = raw.split_once('#').map_or(raw, |(rule, _)| rule).trim();
            if line.is_empty() {
                continue;
            }
            blocklist
                .add_rule(line)
                .map_err(|reason| BlocklistError::InvalidRule {
                    line: index + 1,
                    reason,
                })?;
        }
        Ok(blocklist)
    }

    pub fn is_blocked(&self, addr: IpAddr) -> bool {
        match addr {
            IpAddr::V4(ip) => {
                let value = u32::from(ip);
                self.v4.iter().any(|&(start, end)| (start..=end).contains(&value))
            }
            IpAddr::V6(ip) => {
                if let Some(mapped) = ip.to_ipv4_mapped() {
                    return self.is_blocked(IpAddr::V4(mapped));
                }
                let value = u128::from(ip);
                self.v6.iter().any(|&(start, end)| (start..=end).contains(&value))
            }
        }
    }

    /// Number of rules.
    pub fn len(&self) -> usize {
        self.v4.len() + self.v6.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn add_rule(&mut self, rule: &str) -> Result<(), String> {
        if let Some((start, end)) = rule.split_once('-') {
            let start = parse_ip(start, "range start")?;
            let end = parse_ip(end, "range end")?;
            match (start, end) {
                (IpAddr::V4(start), IpAddr::V4(end)) => {
                    let (low, high) = ordered(u32::from(start), u32::from(end));
                    self.v4.push((low, high));
                }
                (IpAddr::V6(start), IpAddr::V6(end)) => {
                    let (low, high) = ordered(u128::from(start), u128::from(end));
                    self.v6.push((low, high));
                }
                _ => return Err("range mixes IPv4 and IPv6".to_string()),
            }
        } else if let Some((base, prefix)) = rule.split_once('/') {
            let prefix = prefix
                .trim()
                .parse::<u8>()
                .map_err(|_| format!("invalid CIDR prefix '{}'", prefix.trim()))?;
            match parse_ip(base, "CIDR base")? {
                IpAddr::V4(ip) => self.v4.push(cidr_v4(ip, prefix)?),
                IpAddr::V6(ip) => self.v6.push(cidr_v6(ip, prefix)?),
            }
        } else {
            match parse_ip(rule, "address")? {
                IpAddr::V4(ip) => self.v4.push((u32::from(ip), u32::from(ip))),
                IpAddr::V6(ip) => self.v6.push((u128::from(ip), u128::from(ip))),
            }
        }
        Ok(())
    }
}

fn parse_ip(text: &str, what: &str) -> Result<IpAddr, String> {
    text.trim()
        .parse()
        .map_err(|_| format!("invalid {what} '{}'", text.trim()))
}

fn ordered<T: Ord>(a: T, b: T) -> (T, T) {
    if a <= b { (a, b) } else { (b, a) }
}

fn cidr_v4(ip: Ipv4Addr, prefix: u8) -> Result<(u32, u32), String> {
    if prefix > 32 {
        return Err(format!("CIDR prefix {prefix} out of range"));
    }
    let mask = u32::MAX.checked_shl(32 - prefix as u32).unwrap_or(0);
    let start = u32::from(ip) & mask;
    Ok((start, start | !mask))
}

fn cidr_v6(ip: Ipv6Addr, prefix: u8) -> Result<(u128, u128), String> {
    if prefix > 128 {
        return Err(format!("CIDR prefix {prefix} out of range"));
    }
    let mask = u128::MAX.checked_shl(128 - prefix as u32).unwrap_or(0);
    let start = u128::from(ip) & mask;
    Ok((start, start | !mask))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v4(a: u8, b: u8, c: u8, d: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(a, b, c, d))
    }

    #[test]
    fn test_parse_ranges_cidr_and_single_addresses() {
        let blocklist = Blocklist::parse(
            "10.0.0.1\n10.0.0.10 - 10.0.0.4\n192.168.1.0/24\n2001:db8::/32\n",
        )
        .unwrap();

        assert_eq!(blocklist.len(), 4);
        assert!(blocklist.is_blocked(v4(10, 0, 0, 1)));
        assert!(blocklist.is_blocked(v4(10, 0, 0, 7)));
        assert!(!blocklist.is_blocked(v4(10, 0, 0, 11)));
        assert!(blocklist.is_blocked(v4(192, 168, 1, 200)));
        assert!(blocklist.is_blocked("2001:db8::1".parse().unwrap()));
        assert!(!blocklist.is_blocked(v4(172, 16, 0, 1)));
    }

    #[test]
    fn test_parse_comments_and_blank_lines_ignored() {
        let blocklist = Blocklist::parse(
            "# header\n\n10.0.0.0/8\n192.0.2.1 # inline comment\n   \n",
        )
        .unwrap();

        assert_eq!(blocklist.len(), 2);
        assert!(blocklist.is_blocked(v4(10, 10, 10, 10)));
        assert!(blocklist.is_blocked(v4(192, 0, 2, 1)));
    }

    #[test]
    fn test_parse_invalid_line_reports_line_number() {
        let error = Blocklist::parse("10.0.0.1\nnot-an-ip\n").unwrap_err();
        assert!(matches!(error, BlocklistError::InvalidRule { line: 2, .. }));

        assert!(Blocklist::parse("1.2.3.4/33").is_err());
        assert!(Blocklist::parse("::1/129").is_err());
        assert!(Blocklist::parse("1.2.3.4 - ::1").is_err());
    }

    #[test]
    fn test_is_blocked_zero_prefix_matches_everything() {
        let blocklist = Blocklist::parse("0.0.0.0/0").unwrap();
        assert!(blocklist.is_blocked(v4(8, 8, 8, 8)));
        assert!(blocklist.is_blocked("::ffff:1.2.3.4".parse().unwrap()));
        assert!(!blocklist.is_blocked("2001:db8::1".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_load_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let result = Blocklist::load(&dir.path().join("missing.txt")).await;
        assert!(matches!(result, Err(BlocklistError::Read { .. })));

        let path = dir.path().join("list.txt");
        std::fs::write(&path, "203.0.113.0/24\n").unwrap();
        let blocklist = Blocklist::load(&path).await.unwrap();
        assert!(blocklist.is_blocked(v4(203, 0, 113, 9)));
    }
}
