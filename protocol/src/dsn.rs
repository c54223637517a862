use smol_str::{format_smolstr, SmolStr};

/// True if the libpq-style connect string already sets `key`.
///
/// Values may be single-quoted; quoted spans are skipped so a quoted value
/// containing "user=" does not count as the key.
pub fn has_key(dsn: &str, key: &str) -> bool {
    let bytes = dsn.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        while i < bytes.len() && bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        let start = i;
        while i < bytes.len() && bytes[i] != b'=' && !bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        if i >= bytes.len() || bytes[i] != b'=' {
            return false;
        }
        let found = &dsn[start..i];
        if found == key {
            return true;
        }
        // skip the value, honoring single quotes
        i += 1;
        if i < bytes.len() && bytes[i] == b'\'' {
            i += 1;
            while i < bytes.len() {
                match bytes[i] {
                    b'\\' => i += 2,
                    b'\'' => {
                        i += 1;
                        break;
                    }
                    _ => i += 1,
                }
            }
        } else {
            while i < bytes.len() && !bytes[i].is_ascii_whitespace() {
                i += 1;
            }
        }
    }
    false
}

/// Append `user=<user>` when the connect string does not pick one itself.
pub fn ensure_user(dsn: &str, user: &str) -> SmolStr {
    if has_key(dsn, "user") {
        return dsn.into();
    }
    format_smolstr!("{dsn} user={user}")
}

/// Append the configured keepalive options. Zero values are left to the
/// transport's defaults.
pub fn append_keepalives(dsn: &str, idle: i64, interval: i64, count: i64) -> SmolStr {
    let mut out = String::from(dsn);
    if idle > 0 {
        out.push_str(&format!(" keepalives_idle={idle}"));
    }
    if interval > 0 {
        out.push_str(&format!(" keepalives_interval={interval}"));
    }
    if count > 0 {
        out.push_str(&format!(" keepalives_count={count}"));
    }
    out.into()
}
