//! RESP2 wire codec.
//!
//! Requests arrive either as inline commands (`SET name Alice\r\n`,
//! tokenized on whitespace; bare LF accepted for telnet) or as RESP arrays
//! of bulk strings (`*3\r\n$3\r\nSET\r\n...`), which is what real Redis
//! clients send.
//!
//! [`parse`] returns `Ok(None)` when the buffer holds only a prefix of a
//! request — the caller reads more bytes and retries. A frame that can never
//! parse (garbage array header, bad length) is a protocol error; the RESP
//! stream cannot be resynchronized after one of those.

use crate::errproto;
use crate::error::Result;

/// A parsed request: its tokens and how many bytes of the buffer it used.
pub type Parsed = Option<(Vec<Vec<u8>>, usize)>;

pub fn parse(buf: &[u8]) -> Result<Parsed> {
    if buf.is_empty() {
        return Ok(None);
    }
    if buf[0] == b'*' {
        parse_array(buf)
    } else {
        parse_inline(buf)
    }
}

/// `*N\r\n` followed by N bulk strings `$LEN\r\n<bytes>\r\n`.
fn parse_array(buf: &[u8]) -> Result<Parsed> {
    let Some(header_end) = find_crlf(buf, 1) else {
        return Ok(None);
    };
    let count = parse_int(&buf[1..header_end])?;
    if count < 0 {
        return errproto!("negative array length");
    }

    let mut pos = header_end + 2;
    let mut tokens = Vec::with_capacity(count as usize);
    for _ in 0..count {
        if pos >= buf.len() {
            return Ok(None);
        }

        if buf[pos] != b'$' {
            // Tolerate non-bulk elements by taking the rest of their line.
            let Some(line_end) = find_crlf(buf, pos) else {
                return Ok(None);
            };
            let token_start = (pos + 1).min(line_end);
            tokens.push(buf[token_start..line_end].to_vec());
            pos = line_end + 2;
            continue;
        }

        let Some(len_end) = find_crlf(buf, pos + 1) else {
            return Ok(None);
        };
        let len = parse_int(&buf[pos + 1..len_end])?;
        if len < 0 {
            // Null bulk string.
            tokens.push(Vec::new());
            pos = len_end + 2;
            continue;
        }

        let data_start = len_end + 2;
        let data_end = data_start + len as usize;
        if data_end + 2 > buf.len() {
            return Ok(None);
        }
        tokens.push(buf[data_start..data_end].to_vec());
        pos = data_end + 2;
    }

    Ok(Some((tokens, pos)))
}

/// One line, tokenized on whitespace. CRLF or bare LF terminates; without a
/// newline the request is incomplete.
fn parse_inline(buf: &[u8]) -> Result<Parsed> {
    let Some(newline) = buf.iter().position(|&b| b == b'\n') else {
        return Ok(None);
    };
    let consumed = newline + 1;
    let mut line = &buf[..newline];
    if line.last() == Some(&b'\r') {
        line = &line[..line.len() - 1];
    }

    let tokens = line
        .split(|&b| b == b' ' || b == b'\t')
        .filter(|token| !token.is_empty())
        .map(|token| token.to_vec())
        .collect();
    Ok(Some((tokens, consumed)))
}

fn find_crlf(buf: &[u8], from: usize) -> Option<usize> {
    (from..buf.len().saturating_sub(1)).find(|&i| buf[i] == b'\r' && buf[i + 1] == b'\n')
}

fn parse_int(digits: &[u8]) -> Result<i64> {
    let text = std::str::from_utf8(digits)
        .map_err(|_| crate::error::Error::Protocol("non-ascii length".into()))?;
    text.parse()
        .map_err(|_| crate::error::Error::Protocol(format!("invalid length '{text}'")))
}

// ── Reply encoding ──

pub fn simple_string(s: &str) -> Vec<u8> {
    format!("+{s}\r\n").into_bytes()
}

pub fn error(msg: &str) -> Vec<u8> {
    format!("-ERR {msg}\r\n").into_bytes()
}

pub fn integer(n: i64) -> Vec<u8> {
    format!(":{n}\r\n").into_bytes()
}

pub fn bulk(data: &[u8]) -> Vec<u8> {
    let mut out = format!("${}\r\n", data.len()).into_bytes();
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
    out
}

pub fn null_bulk() -> Vec<u8> {
    b"$-1\r\n".to_vec()
}

pub fn array(items: &[Vec<u8>]) -> Vec<u8> {
    let mut out = format!("*{}\r\n", items.len()).into_bytes();
    for item in items {
        out.extend_from_slice(&bulk(item));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(parsed: Parsed) -> Vec<Vec<u8>> {
        parsed.expect("complete request").0
    }

    #[test]
    fn test_inline_command() -> Result<()> {
        let (toks, consumed) = parse(b"SET name Alice\r\n")?.unwrap();
        assert_eq!(toks, vec![b"SET".to_vec(), b"name".to_vec(), b"Alice".to_vec()]);
        assert_eq!(consumed, 16);
        Ok(())
    }

    #[test]
    fn test_inline_lf_only() -> Result<()> {
        let toks = tokens(parse(b"GET key\n")?);
        assert_eq!(toks, vec![b"GET".to_vec(), b"key".to_vec()]);
        Ok(())
    }

    #[test]
    fn test_inline_extra_whitespace() -> Result<()> {
        let toks = tokens(parse(b"  SET   a \t b \r\n")?);
        assert_eq!(toks, vec![b"SET".to_vec(), b"a".to_vec(), b"b".to_vec()]);
        Ok(())
    }

    #[test]
    fn test_inline_without_newline_is_incomplete() -> Result<()> {
        assert!(parse(b"SET name Ali")?.is_none());
        assert!(parse(b"")?.is_none());
        Ok(())
    }

    #[test]
    fn test_array_framing() -> Result<()> {
        let buf = b"*3\r\n$3\r\nSET\r\n$4\r\nname\r\n$6\r\nGemini\r\n";
        let (toks, consumed) = parse(buf)?.unwrap();
        assert_eq!(toks, vec![b"SET".to_vec(), b"name".to_vec(), b"Gemini".to_vec()]);
        assert_eq!(consumed, buf.len());
        Ok(())
    }

    #[test]
    fn test_array_incomplete() -> Result<()> {
        // Progressive prefixes of a complete frame must all ask for more.
        let buf = b"*2\r\n$3\r\nGET\r\n$4\r\nname\r\n";
        for end in 0..buf.len() {
            assert!(parse(&buf[..end])?.is_none(), "prefix of {end} bytes");
        }
        assert!(parse(buf)?.is_some());
        Ok(())
    }

    #[test]
    fn test_array_value_with_spaces_stays_one_token() -> Result<()> {
        let buf = b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$11\r\nhello world\r\n";
        let toks = tokens(parse(buf)?);
        assert_eq!(toks[2], b"hello world".to_vec());
        Ok(())
    }

    #[test]
    fn test_null_bulk_element() -> Result<()> {
        let buf = b"*2\r\n$3\r\nGET\r\n$-1\r\n";
        let toks = tokens(parse(buf)?);
        assert_eq!(toks, vec![b"GET".to_vec(), Vec::new()]);
        Ok(())
    }

    #[test]
    fn test_malformed_count_is_protocol_error() {
        assert!(parse(b"*abc\r\n").is_err());
        assert!(parse(b"*2\r\n$xyz\r\nAB\r\n").is_err());
    }

    #[test]
    fn test_pipelined_requests_consume_one_at_a_time() -> Result<()> {
        let buf = b"PING\r\nGET k\r\n";
        let (toks, consumed) = parse(buf)?.unwrap();
        assert_eq!(toks, vec![b"PING".to_vec()]);

        let (toks, _) = parse(&buf[consumed..])?.unwrap();
        assert_eq!(toks, vec![b"GET".to_vec(), b"k".to_vec()]);
        Ok(())
    }

    #[test]
    fn test_empty_inline_line_yields_no_tokens() -> Result<()> {
        let (toks, consumed) = parse(b"\r\n")?.unwrap();
        assert!(toks.is_empty());
        assert_eq!(consumed, 2);
        Ok(())
    }

    #[test]
    fn test_encoders() {
        assert_eq!(simple_string("OK"), b"+OK\r\n");
        assert_eq!(error("unknown command 'X'"), b"-ERR unknown command 'X'\r\n".to_vec());
        assert_eq!(integer(42), b":42\r\n");
        assert_eq!(integer(-1), b":-1\r\n");
        assert_eq!(bulk(b"Alice"), b"$5\r\nAlice\r\n");
        assert_eq!(null_bulk(), b"$-1\r\n");
        assert_eq!(
            array(&[b"a".to_vec(), b"bc".to_vec()]),
            b"*2\r\n$1\r\na\r\n$2\r\nbc\r\n"
        );
        assert_eq!(array(&[]), b"*0\r\n");
    }
}
