use super::CommandProcessor;
use crate::error::Result;
use feoxdb::{FeoxError, FeoxStore};
use memchr::memchr;

const OK_RESPONSE: &[u8] = b"OK";
const NIL_RESPONSE: &[u8] = b"(nil)";
const PONG_RESPONSE: &[u8] = b"PONG";

/// Plain-text key/value command processor over FeOxDB
///
/// One request is one command line: `SET key value`, `GET key`,
/// `DEL key...`, `EXISTS key...` or `PING [message]`. Responses carry no
/// trailing newline.
pub struct KvProcessor {
    store: FeoxStore,
}

impl KvProcessor {
    /// Create a memory-only processor
    pub fn new(max_memory: Option<usize>) -> Result<Self> {
        let mut builder = FeoxStore::builder();
        if let Some(limit) = max_memory {
            builder = builder.max_memory(limit);
        }
        Ok(Self {
            store: builder.build()?,
        })
    }

    fn set(&self, key: &[u8], value: &[u8]) -> Vec<u8> {
        match self.store.insert_with_timestamp(key, value, None) {
            Ok(_) => OK_RESPONSE.to_vec(),
            Err(e) => error_reply(&e),
        }
    }

    fn get(&self, key: &[u8]) -> Vec<u8> {
        match self.store.get_bytes(key) {
            Ok(value) => value.to_vec(),
            Err(FeoxError::KeyNotFound) => NIL_RESPONSE.to_vec(),
            Err(e) => error_reply(&e),
        }
    }

    fn del(&self, keys: Args<'_>) -> Vec<u8> {
        let removed = keys.filter(|key| self.store.delete(key).is_ok()).count();
        integer_reply(removed)
    }

    fn exists(&self, keys: Args<'_>) -> Vec<u8> {
        let found = keys.filter(|key| self.store.contains_key(key)).count();
        integer_reply(found)
    }
}

impl CommandProcessor for KvProcessor {
    fn handle(&self, request: &[u8]) -> Vec<u8> {
        let line = trim(request);
        let (name, rest) = split_token(line);
        if name.is_empty() {
            return b"ERR empty command".to_vec();
        }

        match name.to_ascii_uppercase().as_slice() {
            b"SET" => {
                let (key, value) = split_token(rest);
                if key.is_empty() || value.is_empty() {
                    return wrong_arity("set");
                }
                self.set(key, value)
            }
            b"GET" => {
                let (key, extra) = split_token(rest);
                if key.is_empty() || !extra.is_empty() {
                    return wrong_arity("get");
                }
                self.get(key)
            }
            b"DEL" if !rest.is_empty() => self.del(Args(rest)),
            b"EXISTS" if !rest.is_empty() => self.exists(Args(rest)),
            b"DEL" => wrong_arity("del"),
            b"EXISTS" => wrong_arity("exists"),
            b"PING" if rest.is_empty() => PONG_RESPONSE.to_vec(),
            b"PING" => rest.to_vec(),
            _ => format!("ERR unknown command '{}'", String::from_utf8_lossy(name)).into_bytes(),
        }
    }
}

/// Whitespace-separated arguments
struct Args<'a>(&'a [u8]);

impl<'a> Iterator for Args<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        let (token, rest) = split_token(self.0);
        self.0 = rest;
        (!token.is_empty()).then_some(token)
    }
}

fn trim(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    &bytes[start..end]
}

/// Split off the first space-delimited token; the remainder has leading spaces removed
fn split_token(bytes: &[u8]) -> (&[u8], &[u8]) {
    let bytes = trim_start(bytes);
    match memchr(b' ', bytes) {
        Some(pos) => (&bytes[..pos], trim_start(&bytes[pos + 1..])),
        None => (bytes, &[]),
    }
}

fn trim_start(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|&b| b != b' ').unwrap_or(bytes.len());
    &bytes[start..]
}

fn integer_reply(n: usize) -> Vec<u8> {
    let mut buf = itoa::Buffer::new();
    buf.format(n).as_bytes().to_vec()
}

fn wrong_arity(cmd: &str) -> Vec<u8> {
    format!("ERR wrong number of arguments for '{}' command", cmd).into_bytes()
}

fn error_reply(err: &FeoxError) -> Vec<u8> {
    format!("ERR {}", err).into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::{fixture, rstest};

    #[fixture]
    fn kv() -> KvProcessor {
        KvProcessor::new(None).unwrap()
    }

    #[rstest]
    fn set_then_get(kv: KvProcessor) {
        assert_eq!(kv.handle(b"SET foo bar"), b"OK");
        assert_eq!(kv.handle(b"GET foo"), b"bar");
    }

    #[rstest]
    fn line_endings_and_case_are_ignored(kv: KvProcessor) {
        assert_eq!(kv.handle(b"set greeting hello world\r\n"), b"OK");
        assert_eq!(kv.handle(b"get greeting\n"), b"hello world");
    }

    #[rstest]
    fn missing_key_is_nil(kv: KvProcessor) {
        assert_eq!(kv.handle(b"GET nope"), b"(nil)");
    }

    #[rstest]
    fn del_and_exists_count_keys(kv: KvProcessor) {
        kv.handle(b"SET a 1");
        kv.handle(b"SET b 2");
        assert_eq!(kv.handle(b"EXISTS a b c"), b"2");
        assert_eq!(kv.handle(b"DEL a c"), b"1");
        assert_eq!(kv.handle(b"EXISTS a b"), b"1");
    }

    #[rstest]
    #[case(b"PING".as_slice(), b"PONG".as_slice())]
    #[case(b"PING hi there".as_slice(), b"hi there".as_slice())]
    #[case(b"".as_slice(), b"ERR empty command".as_slice())]
    #[case(b"  \r\n".as_slice(), b"ERR empty command".as_slice())]
    #[case(b"FLY away".as_slice(), b"ERR unknown command 'FLY'".as_slice())]
    #[case(
        b"SET onlykey".as_slice(),
        b"ERR wrong number of arguments for 'set' command".as_slice()
    )]
    #[case(b"GET a b".as_slice(), b"ERR wrong number of arguments for 'get' command".as_slice())]
    #[case(b"DEL".as_slice(), b"ERR wrong number of arguments for 'del' command".as_slice())]
    fn replies(kv: KvProcessor, #[case] request: &[u8], #[case] expected: &[u8]) {
        assert_eq!(kv.handle(request), expected);
    }

    #[test]
    fn split_token_skips_repeated_spaces() {
        assert_eq!(split_token(b"  SET   k  v"), (&b"SET"[..], &b"k  v"[..]));
        assert_eq!(split_token(b"GET"), (&b"GET"[..], &b""[..]));
    }
}
