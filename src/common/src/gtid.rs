use std::fmt;
use std::str::FromStr;
use tracing::error;

/// A MariaDB global transaction id: `domain-server-sequence`.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Hash)]
pub struct Gtid {
    pub domain_id: u32,
    pub server_id: u32,
    pub sequence_nr: u64,
}

impl Gtid {
    pub fn new(domain_id: u32, server_id: u32, sequence_nr: u64) -> Self {
        Self {
            domain_id,
            server_id,
            sequence_nr,
        }
    }

    /// A gtid read off the wire is valid only if the server id is set.
    pub fn is_valid(&self) -> bool {
        self.server_id != 0
    }

    /// Parse a `domain-server-sequence` string. An empty string yields the
    /// invalid default; a malformed string is logged and also yields the
    /// default so that capture continues without a gtid.
    pub fn parse_lossy(gtid_str: &str) -> Gtid {
        if gtid_str.is_empty() {
            return Gtid::default();
        }
        match gtid_str.parse() {
            Ok(gtid) => gtid,
            Err(_) => {
                error!("Invalid gtid string: '{gtid_str}'");
                Gtid::default()
            }
        }
    }
}

impl FromStr for Gtid {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('-');
        let domain_id = parts.next().and_then(|p| p.parse().ok()).ok_or(())?;
        let server_id = parts.next().and_then(|p| p.parse().ok()).ok_or(())?;
        let sequence_nr = parts.next().and_then(|p| p.parse().ok()).ok_or(())?;
        if parts.next().is_some() {
            return Err(());
        }
        Ok(Gtid::new(domain_id, server_id, sequence_nr))
    }
}

impl fmt::Display for Gtid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.domain_id, self.server_id, self.sequence_nr)
    }
}
