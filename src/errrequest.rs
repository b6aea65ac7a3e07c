//! Error request tokens.
//!
//! A token such as `errLength=128` asks the server to fail the call with an
//! error message of exactly 128 bytes. The client builds tokens with
//! [`encode`]; the server turns them back into a message with [`generate`].
//!
//! ```text
//! encode(5)               -> "errLength=5"
//! parse("errLength=5")    -> Ok(5)
//! generate("errLength=5") -> Ok("this ")
//! ```

use std::num::ParseIntError;

/// Fixed prefix of every token.
pub const PREFIX: &str = "errLength=";

/// Phrase repeated to build generated messages. Must stay ASCII so that any
/// byte offset is a valid slice boundary.
pub const FILLER: &str =
    "this is a long error message abcdefghijklmnopqrstuvwxyz 0123456789 ABCDEFGHIJKLMNOPQRSTUVWXYZ ";

/// Token decoding errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrRequestError {
    /// No room for a length after the prefix
    TooShort(String),
    /// Suffix is not a base-10 integer
    Malformed { token: String, reason: String },
    /// Length is zero, negative or does not fit in memory
    OutOfRange(i64),
}

impl std::fmt::Display for ErrRequestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrRequestError::TooShort(token) => write!(f, "message too short: {:?}", token),
            ErrRequestError::Malformed { token, reason } => {
                write!(f, "invalid message {:?}: {}", token, reason)
            }
            ErrRequestError::OutOfRange(length) => write!(f, "invalid length: {}", length),
        }
    }
}

impl std::error::Error for ErrRequestError {}

impl ErrRequestError {
    fn malformed(token: &str, err: ParseIntError) -> Self {
        ErrRequestError::Malformed {
            token: token.to_string(),
            reason: err.to_string(),
        }
    }
}

/// Build the token asking for an error message of `err_length` bytes.
pub fn encode(err_length: usize) -> String {
    format!("{PREFIX}{err_length}")
}

/// Recover the requested error length from a token.
pub fn parse(token: &str) -> Result<usize, ErrRequestError> {
    if token.len() <= PREFIX.len() {
        return Err(ErrRequestError::TooShort(token.to_string()));
    }

    // Only the prefix length matters, its text is not compared
    let suffix = token
        .get(PREFIX.len()..)
        .ok_or_else(|| ErrRequestError::Malformed {
            token: token.to_string(),
            reason: "length does not start on a character boundary".to_string(),
        })?;

    let length: i64 = suffix
        .parse()
        .map_err(|e| ErrRequestError::malformed(token, e))?;
    if length <= 0 {
        return Err(ErrRequestError::OutOfRange(length));
    }

    usize::try_from(length).map_err(|_| ErrRequestError::OutOfRange(length))
}

/// Parse a token and build an error message of exactly the requested length.
pub fn generate(token: &str) -> Result<String, ErrRequestError> {
    let err_length = parse(token)?;
    Ok(fill(err_length))
}

/// Repeat [`FILLER`] until the output is exactly `err_length` bytes.
///
/// # Panics
///
/// Panics if the produced message does not have the requested length. That
/// can only happen if the truncation arithmetic below is wrong.
pub fn fill(err_length: usize) -> String {
    let mut out = String::with_capacity(err_length);
    while out.len() < err_length {
        let next = FILLER.len().min(err_length - out.len());
        out.push_str(&FILLER[..next]);
    }

    assert_eq!(
        out.len(),
        err_length,
        "BUG: generated message has incorrect length"
    );
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode() {
        assert_eq!(encode(128), "errLength=128");
        assert_eq!(encode(1), "errLength=1");
    }

    #[test]
    fn test_round_trip() {
        for length in (1..=300).chain([1024, 16 * 1024 * 1024, usize::MAX >> 1]) {
            assert_eq!(parse(&encode(length)), Ok(length));
        }
    }

    #[test]
    fn test_too_short() {
        assert_eq!(
            parse("garbage"),
            Err(ErrRequestError::TooShort("garbage".to_string()))
        );
        assert!(matches!(parse(""), Err(ErrRequestError::TooShort(_))));
        assert!(matches!(parse(PREFIX), Err(ErrRequestError::TooShort(_))));
    }

    #[test]
    fn test_malformed() {
        let tokens = [
            "errLength=abc",
            "errLength=12x",
            "errLength= 5",
            "errLength=99999999999999999999",
        ];
        for token in tokens {
            match parse(token) {
                Err(ErrRequestError::Malformed { token: t, .. }) => assert_eq!(t, token),
                other => panic!("unexpected for {token}: {:?}", other),
            }
        }
    }

    #[test]
    fn test_malformed_multibyte_suffix() {
        // 9 ASCII bytes then a two-byte character straddling the prefix length
        let token = "errLength\u{e9}5";
        assert!(matches!(parse(token), Err(ErrRequestError::Malformed { .. })));
    }

    #[test]
    fn test_out_of_range() {
        assert_eq!(parse("errLength=0"), Err(ErrRequestError::OutOfRange(0)));
        assert_eq!(parse("errLength=-5"), Err(ErrRequestError::OutOfRange(-5)));
    }

    #[test]
    fn test_explicit_plus_sign_accepted() {
        assert_eq!(parse("errLength=+5"), Ok(5));
        assert_eq!(generate("errLength=+5").unwrap(), "this ");
        assert_eq!(parse("errLength=+0"), Err(ErrRequestError::OutOfRange(0)));
        assert!(matches!(parse("errLength=++5"), Err(ErrRequestError::Malformed { .. })));
    }

    #[test]
    fn test_error_messages_name_the_token() {
        let err = parse("errLength=abc").unwrap_err();
        assert!(err.to_string().contains("\"errLength=abc\""));

        let err = parse("garbage").unwrap_err();
        assert_eq!(err.to_string(), "message too short: \"garbage\"");
    }

    #[test]
    fn test_generate_scenarios() {
        assert_eq!(generate("errLength=1").unwrap(), "t");

        assert!(FILLER.len() > 70);
        assert_eq!(generate("errLength=70").unwrap(), &FILLER[..70]);

        let body = generate("errLength=140").unwrap();
        assert_eq!(body.len(), 140);
        assert_eq!(&body[..FILLER.len()], FILLER);
        assert_eq!(&body[FILLER.len()..], &FILLER[..140 - FILLER.len()]);
    }

    #[test]
    fn test_generate_exact_lengths() {
        let lengths = [
            1,
            FILLER.len() - 1,
            FILLER.len(),
            FILLER.len() + 1,
            FILLER.len() * 7,
            FILLER.len() * 100 + 3,
            8003,
        ];
        for length in lengths {
            let body = generate(&encode(length)).unwrap();
            assert_eq!(body.len(), length);
            assert!(body.starts_with(&FILLER[..length.min(FILLER.len())]));
        }
    }

    #[test]
    fn test_generate_propagates_decode_errors() {
        assert!(matches!(generate("errLength="), Err(ErrRequestError::TooShort(_))));
        assert!(matches!(generate("errLength=0"), Err(ErrRequestError::OutOfRange(0))));
        assert!(matches!(generate("garbage"), Err(ErrRequestError::TooShort(_))));
        assert!(matches!(
            generate("errLength=abc"),
            Err(ErrRequestError::Malformed { .. })
        ));
    }
}
