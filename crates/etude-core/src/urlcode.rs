// src/urlcode.rs
//! Form-style percent coding: alphanumerics and `-_.*` pass through, space becomes `+`,
//! every other byte becomes `%XX`.

use std::borrow::Cow;

use percent_encoding::percent_decode;

use crate::error::{EtudeError, EtudeResult};

pub fn encode(input: &str) -> String {
    form_urlencoded::byte_serialize(input.as_bytes()).collect()
}

/// Decode `+` as space and `%XX` escapes. Malformed escapes are kept literally.
pub fn decode_bytes(input: &[u8]) -> Vec<u8> {
    let plus_free: Cow<'_, [u8]> = if input.contains(&b'+') {
        Cow::Owned(
            input
                .iter()
                .map(|&b| if b == b'+' { b' ' } else { b })
                .collect(),
        )
    } else {
        Cow::Borrowed(input)
    };
    percent_decode(&plus_free).collect()
}

pub fn decode(input: &str) -> EtudeResult<String> {
    String::from_utf8(decode_bytes(input.as_bytes()))
        .map_err(|_| EtudeError::Decode(format!("{:?} is not UTF-8 once decoded", input)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_form_style() {
        assert_eq!(encode("a b"), "a+b");
        assert_eq!(encode("-_.*"), "-_.*");
        assert_eq!(encode("/x?y=1"), "%2Fx%3Fy%3D1");
        assert_eq!(encode("é"), "%C3%A9");
    }

    #[test]
    fn decodes_plus_and_escapes() {
        assert_eq!(decode("a+b%20c").unwrap(), "a b c");
        assert_eq!(decode("%2Fpath%2f").unwrap(), "/path/");
        assert_eq!(decode("100%").unwrap(), "100%");
        assert!(decode("%FF").is_err());
    }

    #[test]
    fn round_trips_path_segments() {
        let alphabet: Vec<char> = ('a'..='z')
            .chain('A'..='Z')
            .chain('0'..='9')
            .chain(['-', '_', '.', '*', ' '])
            .collect();
        for len in 0..24 {
            let segment: String = (0..len)
                .map(|i| alphabet[(i * 7 + len * 3) % alphabet.len()])
                .collect();
            assert_eq!(decode(&encode(&segment)).unwrap(), segment);
        }
        let everything: String = alphabet.iter().collect();
        assert_eq!(decode(&encode(&everything)).unwrap(), everything);
    }
}
