//! Small shared helpers: monotonic microsecond clock and random identifiers.

use std::io::Read;
use std::sync::OnceLock;
use std::time::Instant;

/// Microseconds on a process-local monotonic clock. Used for keepalive
/// bookkeeping and the time-sync exchange; never compared across processes
/// except through the estimator.
pub fn now_us() -> i64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    let epoch = EPOCH.get_or_init(Instant::now);
    epoch.elapsed().as_micros() as i64
}

const UPPER: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ";
const UPPER_DIGITS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const ALNUM: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// Random string over a charset, backed by /dev/urandom.
pub fn random_string(charset: &[u8], len: usize) -> String {
    let mut bytes = vec![0u8; len];
    let f = std::fs::File::open("/dev/urandom").expect("Failed to open /dev/urandom");
    (&f).read_exact(&mut bytes)
        .expect("Failed to read random bytes");
    bytes
        .iter()
        .map(|b| charset[*b as usize % charset.len()] as char)
        .collect()
}

/// 6-char user-visible access code, `[A-Z0-9]`.
pub fn random_access_token() -> String {
    random_string(UPPER_DIGITS, 6)
}

/// 24-char per-peer reconnect cookie.
pub fn random_cookie() -> String {
    random_string(ALNUM, 24)
}

/// 8-char worker session name.
pub fn random_session_name() -> String {
    random_string(ALNUM, 8)
}

/// 4 uppercase letters appended to the worker pipe prefix.
pub fn random_pipe_suffix() -> String {
    random_string(UPPER, 4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_us_is_monotonic() {
        let a = now_us();
        let b = now_us();
        assert!(b >= a);
    }

    #[test]
    fn access_token_shape() {
        let token = random_access_token();
        assert_eq!(token.len(), 6);
        assert!(
            token
                .chars()
                .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
        );
    }

    #[test]
    fn cookie_shape() {
        let cookie = random_cookie();
        assert_eq!(cookie.len(), 24);
        assert!(cookie.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn pipe_suffix_is_uppercase_letters() {
        let suffix = random_pipe_suffix();
        assert_eq!(suffix.len(), 4);
        assert!(suffix.chars().all(|c| c.is_ascii_uppercase()));
    }

    #[test]
    fn random_strings_differ() {
        assert_ne!(random_cookie(), random_cookie());
    }
}
