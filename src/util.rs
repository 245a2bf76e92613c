use bstr::ByteSlice;
use nom::{
    bytes::streaming::{tag, take_until},
    sequence::terminated,
    IResult,
};

/// Lossy UTF-8 display form of raw payload bytes.
pub fn lossy(bytes: &[u8]) -> String {
    bytes.to_str_lossy().into_owned()
}

/// Parse one CRLF-terminated line, excluding the terminator.
pub fn crlf_line(input: &[u8]) -> IResult<&[u8], &[u8]> {
    terminated(take_until("\r\n"), tag("\r\n"))(input)
}

/// Read one CRLF-terminated line from `input`.
///
/// Returns the line without its terminator and the number of bytes
/// consumed including the terminator, or `None` when no full line is
/// buffered yet.
pub fn read_crlf_line(input: &[u8]) -> Option<(&[u8], usize)> {
    match crlf_line(input) {
        Ok((rest, line)) => Some((line, input.len() - rest.len())),
        Err(_) => None,
    }
}

/// Returns true for SP and HTAB.
pub fn is_blank(c: u8) -> bool {
    c == b' ' || c == b'\t'
}

/// Strip leading and trailing SP/HTAB bytes.
pub fn trimmed(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|&b| !is_blank(b))
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|&b| !is_blank(b))
        .map(|p| p + 1)
        .unwrap_or(start);
    &bytes[start..end]
}

/// The first whitespace-delimited word of `bytes` (SP, HTAB, CR, LF).
pub fn first_word(bytes: &[u8]) -> &[u8] {
    let end = bytes
        .iter()
        .position(|&b| is_blank(b) || b == b'\r' || b == b'\n')
        .unwrap_or(bytes.len());
    &bytes[..end]
}

/// Parse a chunk-size line: hex digits with optional surrounding blanks.
pub fn parse_hex_length(line: &[u8]) -> Option<usize> {
    let digits = trimmed(line);
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_hexdigit) {
        return None;
    }
    usize::from_str_radix(std::str::from_utf8(digits).ok()?, 16).ok()
}

#[cfg(test)]
mod test {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::simple(b"abc\r\ndef", Some((&b"abc"[..], 5)))]
    #[case::empty_line(b"\r\nrest", Some((&b""[..], 2)))]
    #[case::no_terminator(b"abc", None)]
    #[case::bare_cr(b"abc\r", None)]
    fn test_read_crlf_line(#[case] input: &[u8], #[case] expected: Option<(&[u8], usize)>) {
        assert_eq!(read_crlf_line(input), expected);
    }

    #[rstest]
    #[case(b" \tabc \t", b"abc")]
    #[case(b"abc", b"abc")]
    #[case(b"  ", b"")]
    #[case(b"", b"")]
    fn test_trimmed(#[case] input: &[u8], #[case] expected: &[u8]) {
        assert_eq!(trimmed(input), expected);
    }

    #[rstest]
    #[case(b"SELECT 1", b"SELECT")]
    #[case(b"ping", b"ping")]
    #[case(b"a\tb", b"a")]
    #[case(b"a\nb", b"a")]
    fn test_first_word(#[case] input: &[u8], #[case] expected: &[u8]) {
        assert_eq!(first_word(input), expected);
    }

    #[rstest]
    #[case(b"5", Some(5))]
    #[case(b"1a", Some(26))]
    #[case(b"  12a5  ", Some(0x12a5))]
    #[case(b"", None)]
    #[case(b"xyz", None)]
    fn test_parse_hex_length(#[case] input: &[u8], #[case] expected: Option<usize>) {
        assert_eq!(parse_hex_length(input), expected);
    }
}
