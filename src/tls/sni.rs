//! TLS ClientHello SNI sniffing.
//!
//! Parses the leading bytes of the first TLS record to extract the
//! `server_name` extension before any TLS engine exists, so the right
//! certificate context can be chosen per virtual host. Pure function, no
//! state: feed it whatever has been buffered so far and act on the outcome.

/// Outcome of one sniff attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sniff {
    /// Not enough bytes buffered yet; read more and try again.
    Incomplete,
    /// Parse finished. `None` means no SNI hostname was present; also the
    /// verdict for non-TLS bytes (plain HTTP on a TLS port) and for
    /// non-ClientHello handshake records.
    Done(Option<String>),
    /// The record is definitively malformed; the connection must be closed
    /// without a response.
    Malformed(&'static str),
}

const RECORD_HANDSHAKE: u8 = 22;
const HANDSHAKE_CLIENT_HELLO: u8 = 1;
const EXTENSION_SERVER_NAME: u16 = 0;
const NAME_TYPE_HOST_NAME: u8 = 0;

/// Minimum ClientHello skeleton inside the record: handshake header (4),
/// client version (2), random (32), session_id length (1).
const MIN_CLIENT_HELLO: usize = 4 + 2 + 32 + 1;

/// Strictly length-guarded cursor over the handshake body. Any declared
/// length that overruns the record boundary is a malformed hello.
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn u8(&mut self) -> Result<u8, ()> {
        let b = *self.buf.get(self.pos).ok_or(())?;
        self.pos += 1;
        Ok(b)
    }

    fn u16(&mut self) -> Result<u16, ()> {
        if self.remaining() < 2 {
            return Err(());
        }
        let v = u16::from_be_bytes([self.buf[self.pos], self.buf[self.pos + 1]]);
        self.pos += 2;
        Ok(v)
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], ()> {
        if self.remaining() < len {
            return Err(());
        }
        let s = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(s)
    }

    fn skip(&mut self, len: usize) -> Result<(), ()> {
        self.take(len).map(|_| ())
    }
}

/// Inspects the buffered prefix of a connection for a TLS ClientHello and
/// extracts the SNI hostname if one is present.
///
/// The ClientHello must fit in a single TLS record; a handshake message
/// split across records is unsupported and reported as malformed.
pub fn sniff(buf: &[u8]) -> Sniff {
    // Record header: type(1) version(2) length(2).
    if buf.len() < 5 {
        return Sniff::Incomplete;
    }
    if buf[0] != RECORD_HANDSHAKE {
        // Not TLS at all; plain HTTP fallback, not an error.
        return Sniff::Done(None);
    }
    let record_len = usize::from(u16::from_be_bytes([buf[3], buf[4]]));
    if buf.len() < 5 + record_len {
        return Sniff::Incomplete;
    }
    let record = &buf[5..5 + record_len];

    if record.len() < MIN_CLIENT_HELLO {
        return Sniff::Malformed("record shorter than ClientHello skeleton");
    }
    if record[0] != HANDSHAKE_CLIENT_HELLO {
        return Sniff::Done(None);
    }
    let hello_len =
        (usize::from(record[1]) << 16) | (usize::from(record[2]) << 8) | usize::from(record[3]);
    if 4 + hello_len > record.len() {
        return Sniff::Malformed("ClientHello split across TLS records");
    }

    match parse_client_hello(&record[4..4 + hello_len]) {
        Ok(name) => Sniff::Done(name),
        Err(reason) => Sniff::Malformed(reason),
    }
}

fn parse_client_hello(body: &[u8]) -> Result<Option<String>, &'static str> {
    let overrun = "field length overruns ClientHello";
    let mut cur = Cursor::new(body);

    // client_version + random.
    cur.skip(2 + 32).map_err(|_| overrun)?;
    // session_id, cipher_suites, compression_methods: length-prefixed,
    // content skipped.
    let session_len = cur.u8().map_err(|_| overrun)?;
    cur.skip(usize::from(session_len)).map_err(|_| overrun)?;
    let ciphers_len = cur.u16().map_err(|_| overrun)?;
    cur.skip(usize::from(ciphers_len)).map_err(|_| overrun)?;
    let compression_len = cur.u8().map_err(|_| overrun)?;
    cur.skip(usize::from(compression_len)).map_err(|_| overrun)?;

    if cur.remaining() == 0 {
        // Legal: a ClientHello without any extensions.
        return Ok(None);
    }

    let extensions_len = cur.u16().map_err(|_| overrun)?;
    let extensions = cur.take(usize::from(extensions_len)).map_err(|_| overrun)?;

    let mut cur = Cursor::new(extensions);
    while cur.remaining() > 0 {
        let ext_type = cur.u16().map_err(|_| overrun)?;
        let ext_len = cur.u16().map_err(|_| overrun)?;
        let ext_body = cur.take(usize::from(ext_len)).map_err(|_| overrun)?;
        if ext_type == EXTENSION_SERVER_NAME {
            return parse_server_name(ext_body);
        }
    }

    Ok(None)
}

fn parse_server_name(body: &[u8]) -> Result<Option<String>, &'static str> {
    let overrun = "field length overruns server_name extension";
    let mut cur = Cursor::new(body);
    let list_len = cur.u16().map_err(|_| overrun)?;
    let list = cur.take(usize::from(list_len)).map_err(|_| overrun)?;

    let mut hostname: Option<String> = None;
    let mut cur = Cursor::new(list);
    while cur.remaining() > 0 {
        let name_type = cur.u8().map_err(|_| overrun)?;
        let name_len = cur.u16().map_err(|_| overrun)?;
        let name = cur.take(usize::from(name_len)).map_err(|_| overrun)?;
        if name_type == NAME_TYPE_HOST_NAME {
            // RFC 6066: at most one entry per name type.
            if hostname.is_some() {
                return Err("duplicate host_name entry in server_name extension");
            }
            let name = std::str::from_utf8(name).map_err(|_| "host_name is not valid UTF-8")?;
            hostname = Some(name.to_ascii_lowercase());
        }
    }
    Ok(hostname)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_tls_first_byte_is_done_without_sni() {
        assert_eq!(sniff(b"GET / HTTP/1.1\r\n"), Sniff::Done(None));
    }

    #[test]
    fn short_prefix_is_incomplete() {
        assert_eq!(sniff(&[22, 3, 1]), Sniff::Incomplete);
    }

    #[test]
    fn partial_record_is_incomplete() {
        // Declares a 100-byte record but only 3 payload bytes buffered.
        let mut buf = vec![22, 3, 1, 0, 100];
        buf.extend_from_slice(&[0, 0, 0]);
        assert_eq!(sniff(&buf), Sniff::Incomplete);
    }

    #[test]
    fn tiny_record_is_malformed() {
        let buf = [22, 3, 1, 0, 2, 1, 0];
        assert!(matches!(sniff(&buf), Sniff::Malformed(_)));
    }
}
