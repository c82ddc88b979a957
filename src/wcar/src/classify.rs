use crate::event::EventFlags;

/// Derive the statement type mask the transaction extractor depends on.
/// This looks only at the leading verbs; full SQL understanding lives in
/// the backend.
pub fn classify(sql: &str) -> EventFlags {
    let trimmed = skip_leading_noise(sql);
    let mut words = trimmed.split_ascii_whitespace();
    let first = match words.next() {
        Some(word) => word.to_ascii_uppercase(),
        None => return EventFlags::empty(),
    };

    match first.as_str() {
        "BEGIN" => EventFlags::BEGIN_TRX,
        "START" => {
            if words
                .next()
                .map(|w| w.eq_ignore_ascii_case("transaction"))
                .unwrap_or(false)
            {
                EventFlags::BEGIN_TRX
            } else {
                EventFlags::WRITE // START SLAVE and friends
            }
        }
        "COMMIT" => EventFlags::COMMIT,
        "ROLLBACK" => {
            // ROLLBACK TO SAVEPOINT keeps the transaction open.
            if words
                .next()
                .map(|w| w.eq_ignore_ascii_case("to"))
                .unwrap_or(false)
            {
                EventFlags::empty()
            } else {
                EventFlags::ROLLBACK
            }
        }
        "SET" => classify_set(trimmed),
        "SELECT" | "SHOW" | "EXPLAIN" | "DESCRIBE" | "DESC" | "HANDLER" | "CHECKSUM" => {
            EventFlags::READ
        }
        "INSERT" | "UPDATE" | "DELETE" | "REPLACE" | "CREATE" | "DROP" | "ALTER" | "TRUNCATE"
        | "RENAME" | "LOAD" | "GRANT" | "REVOKE" | "CALL" | "OPTIMIZE" | "ANALYZE" => {
            EventFlags::WRITE
        }
        _ => EventFlags::empty(),
    }
}

/// `SET autocommit=...` toggles transaction bracketing; every other SET is
/// session state with no transactional meaning here.
fn classify_set(sql: &str) -> EventFlags {
    let lower = sql.to_ascii_lowercase();
    let Some(idx) = lower.find("autocommit") else {
        return EventFlags::empty();
    };
    let rest = &lower[idx + "autocommit".len()..];
    let Some(eq) = rest.find('=') else {
        return EventFlags::empty();
    };
    let value = rest[eq + 1..].trim_start();
    let enabled = value.starts_with('1')
        || value.starts_with("on")
        || value.starts_with("true");
    let disabled = value.starts_with('0')
        || value.starts_with("off")
        || value.starts_with("false");
    if enabled {
        EventFlags::ENABLE_AUTOCOMMIT
    } else if disabled {
        EventFlags::DISABLE_AUTOCOMMIT
    } else {
        EventFlags::empty()
    }
}

fn skip_leading_noise(sql: &str) -> &str {
    let mut rest = sql.trim_start();
    loop {
        if let Some(stripped) = rest.strip_prefix("/*") {
            match stripped.find("*/") {
                Some(end) => rest = stripped[end + 2..].trim_start(),
                None => return "",
            }
        } else if rest.starts_with("--") || rest.starts_with('#') {
            match rest.find('\n') {
                Some(end) => rest = rest[end + 1..].trim_start(),
                None => return "",
            }
        } else {
            return rest;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transaction_verbs() {
        assert_eq!(classify("BEGIN"), EventFlags::BEGIN_TRX);
        assert_eq!(classify("start transaction"), EventFlags::BEGIN_TRX);
        assert_eq!(classify("COMMIT"), EventFlags::COMMIT);
        assert_eq!(classify("rollback"), EventFlags::ROLLBACK);
        assert_eq!(classify("ROLLBACK TO SAVEPOINT sp1"), EventFlags::empty());
    }

    #[test]
    fn autocommit_toggles() {
        assert_eq!(classify("SET autocommit=0"), EventFlags::DISABLE_AUTOCOMMIT);
        assert_eq!(classify("set AUTOCOMMIT = ON"), EventFlags::ENABLE_AUTOCOMMIT);
        assert_eq!(classify("SET @@session.autocommit=1"), EventFlags::ENABLE_AUTOCOMMIT);
        assert_eq!(classify("SET NAMES utf8mb4"), EventFlags::empty());
    }

    #[test]
    fn read_and_write_verbs() {
        assert_eq!(classify("SELECT 1"), EventFlags::READ);
        assert_eq!(classify("UPDATE t SET x=1"), EventFlags::WRITE);
        assert_eq!(classify("INSERT INTO t VALUES (2)"), EventFlags::WRITE);
        assert_eq!(classify("/* hint */ SELECT 1"), EventFlags::READ);
    }
}
