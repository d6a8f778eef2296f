//! Character-set translation
//!
//! Sessions negotiated into UTF-8 mode exchange paths in UTF-8 while the
//! filesystem speaks the host's native encoding. Conversion is best effort:
//! an unknown encoding label or a lossy conversion falls back to returning
//! the input unchanged, so a misconfigured locale degrades to pass-through
//! instead of corrupting traffic.

use encoding_rs::Encoding;

/// Converts `input` between two named encodings. Returns the input verbatim
/// when either label is unknown, when the labels agree, or when the
/// conversion would lose data.
pub fn convert(input: &[u8], from_label: &str, to_label: &str) -> Vec<u8> {
    if input.is_empty() {
        return Vec::new();
    }
    let (Some(from), Some(to)) = (
        Encoding::for_label(from_label.as_bytes()),
        Encoding::for_label(to_label.as_bytes()),
    ) else {
        return input.to_vec();
    };
    if from == to {
        return input.to_vec();
    }
    let (text, _, had_errors) = from.decode(input);
    if had_errors {
        return input.to_vec();
    }
    let (bytes, _, had_errors) = to.encode(&text);
    if had_errors {
        return input.to_vec();
    }
    bytes.into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_when_labels_agree() {
        assert_eq!(convert(b"hello", "UTF-8", "utf-8"), b"hello");
    }

    #[test]
    fn test_unknown_label_passes_through() {
        assert_eq!(convert(b"hello", "no-such-charset", "UTF-8"), b"hello");
    }

    #[test]
    fn test_utf8_to_gbk_round_trip() {
        let utf8 = "目录".as_bytes();
        let gbk = convert(utf8, "UTF-8", "GBK");
        assert_ne!(gbk, utf8);
        assert_eq!(convert(&gbk, "GBK", "UTF-8"), utf8);
    }

    #[test]
    fn test_undecodable_input_passes_through() {
        let broken = [0xff, 0xfe, 0xfd];
        assert_eq!(convert(&broken, "UTF-8", "GBK"), broken);
    }

    #[test]
    fn test_empty_input() {
        assert!(convert(b"", "UTF-8", "GBK").is_empty());
    }
}
