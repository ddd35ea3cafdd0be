use log::debug;

/// Outbound packet buffer with a seekable cursor. Writes past the end grow
/// the buffer; writes inside it overwrite, so the length field can be
/// patched after the payload is known.
///
/// Multi-byte writes are network order (big-endian) unless the method name
/// says otherwise.
#[derive(Debug, Clone)]
pub struct PacketWriter {
    buf: Vec<u8>,
    cursor: usize,
    opcode: u8,
    finalized_length: Option<u16>,
}

/// Bytes reserved at the front of a TCP packet for the length field.
const LENGTH_PREFIX: usize = 2;

/// The checksum covers the payload after this prefix.
const CHECKSUM_SKIP: usize = 8;

impl PacketWriter {
    /// Starts a TCP packet: 2-byte length placeholder, then the opcode.
    /// The placeholder is patched by `write_packet_length`.
    pub fn tcp(opcode: u8) -> Self {
        let mut writer = Self {
            buf: Vec::with_capacity(64),
            cursor: 0,
            opcode,
            finalized_length: None,
        };
        writer.fill(0, LENGTH_PREFIX);
        writer.write_byte(opcode);
        writer
    }

    /// A bare buffer with no framing, for nested payloads.
    pub fn raw() -> Self {
        Self {
            buf: Vec::new(),
            cursor: 0,
            opcode: 0,
            finalized_length: None,
        }
    }

    pub fn opcode(&self) -> u8 {
        self.opcode
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn position(&self) -> usize {
        self.cursor
    }

    pub fn seek(&mut self, position: usize) {
        self.cursor = position;
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn write_byte(&mut self, value: u8) {
        if self.cursor < self.buf.len() {
            self.buf[self.cursor] = value;
        } else {
            self.buf.push(value);
        }
        self.cursor += 1;
    }

    pub fn write_short(&mut self, value: u16) {
        self.write_byte((value >> 8) as u8);
        self.write_byte(value as u8);
    }

    pub fn write_short_low_endian(&mut self, value: u16) {
        self.write_byte(value as u8);
        self.write_byte((value >> 8) as u8);
    }

    pub fn write_int(&mut self, value: u32) {
        self.write_short((value >> 16) as u16);
        self.write_short(value as u16);
    }

    pub fn write_int_low_endian(&mut self, value: u32) {
        self.write_short_low_endian(value as u16);
        self.write_short_low_endian((value >> 16) as u16);
    }

    pub fn write_long(&mut self, value: u64) {
        self.write_int((value >> 32) as u32);
        self.write_int(value as u32);
    }

    pub fn write_long_low_endian(&mut self, value: u64) {
        self.write_int_low_endian(value as u32);
        self.write_int_low_endian((value >> 32) as u32);
    }

    pub fn fill(&mut self, value: u8, count: usize) {
        for _ in 0..count {
            self.write_byte(value);
        }
    }

    /// 1-byte length followed by the bytes. Strings longer than 255 bytes
    /// are silently truncated, length byte 255.
    pub fn write_pascal_string(&mut self, s: &str) {
        let bytes = s.as_bytes();
        let len = bytes.len().min(255);
        self.write_byte(len as u8);
        for &b in &bytes[..len] {
            self.write_byte(b);
        }
    }

    /// Bytes followed by a single 0x00. An empty string still writes the
    /// terminator.
    pub fn write_c_string(&mut self, s: &str) {
        for &b in s.as_bytes() {
            self.write_byte(b);
        }
        self.write_byte(0);
    }

    /// Zero-fills `width` bytes, overwrites with up to `width` bytes of the
    /// string, and leaves the cursor exactly `width` past where it started.
    pub fn write_fixed_string(&mut self, s: &str, width: usize) {
        let start = self.cursor;
        self.fill(0, width);
        self.cursor = start;
        let bytes = s.as_bytes();
        let len = bytes.len().min(width);
        for &b in &bytes[..len] {
            self.write_byte(b);
        }
        self.cursor = start + width;
    }

    /// Patches the length field at offset 0 with `total_len - 3` and returns
    /// it. Calling it again returns the first value unchanged; finishing a
    /// packet twice must not corrupt it mid-broadcast.
    pub fn write_packet_length(&mut self) -> u16 {
        if let Some(value) = self.finalized_length {
            debug!(
                "packet 0x{:02x} finalized twice, keeping length {}",
                self.opcode, value
            );
            return value;
        }
        let value = (self.buf.len() as u16).wrapping_sub(3);
        let saved = self.cursor;
        self.cursor = 0;
        self.write_short(value);
        self.cursor = saved;
        self.finalized_length = Some(value);
        value
    }

    /// Additive u8 checksum over everything past the 8-byte prefix. Buffers
    /// shorter than the prefix yield 0.
    pub fn checksum(&self) -> u8 {
        if self.buf.len() <= CHECKSUM_SKIP {
            return 0;
        }
        self.buf[CHECKSUM_SKIP..]
            .iter()
            .fold(0u8, |sum, &b| sum.wrapping_add(b))
    }
}

/// Bounds-checked reader over a received payload. Every read returns
/// `None` past the end instead of panicking on truncated input.
#[derive(Debug)]
pub struct PacketReader<'a> {
    data: &'a [u8],
    cursor: usize,
}

impl<'a> PacketReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, cursor: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.cursor)
    }

    pub fn read_byte(&mut self) -> Option<u8> {
        let b = *self.data.get(self.cursor)?;
        self.cursor += 1;
        Some(b)
    }

    pub fn read_short(&mut self) -> Option<u16> {
        let hi = self.read_byte()?;
        let lo = self.read_byte()?;
        Some(u16::from(hi) << 8 | u16::from(lo))
    }

    pub fn read_short_low_endian(&mut self) -> Option<u16> {
        let lo = self.read_byte()?;
        let hi = self.read_byte()?;
        Some(u16::from(hi) << 8 | u16::from(lo))
    }

    pub fn read_int(&mut self) -> Option<u32> {
        let hi = self.read_short()?;
        let lo = self.read_short()?;
        Some(u32::from(hi) << 16 | u32::from(lo))
    }

    pub fn read_pascal_string(&mut self) -> Option<String> {
        let len = usize::from(self.read_byte()?);
        let end = self.cursor.checked_add(len)?;
        if end > self.data.len() {
            return None;
        }
        let s = String::from_utf8_lossy(&self.data[self.cursor..end]).into_owned();
        self.cursor = end;
        Some(s)
    }

    pub fn read_c_string(&mut self) -> Option<String> {
        let rest = &self.data[self.cursor..];
        let nul = rest.iter().position(|&b| b == 0)?;
        let s = String::from_utf8_lossy(&rest[..nul]).into_owned();
        self.cursor += nul + 1;
        Some(s)
    }

    pub fn skip(&mut self, count: usize) -> Option<()> {
        let end = self.cursor.checked_add(count)?;
        if end > self.data.len() {
            return None;
        }
        self.cursor = end;
        Some(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tcp_framing_reserves_length_and_opcode() {
        let pkt = PacketWriter::tcp(0x12);
        assert_eq!(pkt.as_bytes(), &[0, 0, 0x12]);
        assert_eq!(pkt.position(), 3);
    }

    #[test]
    fn endianness_pairs() {
        let mut pkt = PacketWriter::raw();
        pkt.write_short(0x1234);
        pkt.write_short_low_endian(0x1234);
        pkt.write_int(0xdeadbeef);
        pkt.write_int_low_endian(0xdeadbeef);
        assert_eq!(
            pkt.as_bytes(),
            &[
                0x12, 0x34, 0x34, 0x12, 0xde, 0xad, 0xbe, 0xef, 0xef, 0xbe, 0xad, 0xde
            ]
        );
    }

    #[test]
    fn long_writes_both_orders() {
        let mut pkt = PacketWriter::raw();
        pkt.write_long(0x0102030405060708);
        pkt.write_long_low_endian(0x0102030405060708);
        assert_eq!(
            pkt.as_bytes(),
            &[1, 2, 3, 4, 5, 6, 7, 8, 8, 7, 6, 5, 4, 3, 2, 1]
        );
    }

    #[test]
    fn pascal_string_truncates_at_255() {
        let long = "x".repeat(300);
        let mut pkt = PacketWriter::raw();
        pkt.write_pascal_string(&long);
        let bytes = pkt.as_bytes();
        assert_eq!(bytes.len(), 256);
        assert_eq!(bytes[0], 255);
        assert!(bytes[1..].iter().all(|&b| b == b'x'));
    }

    #[test]
    fn c_string_terminates_empty_input() {
        let mut pkt = PacketWriter::raw();
        pkt.write_c_string("");
        assert_eq!(pkt.as_bytes(), &[0]);
        pkt.write_c_string("ab");
        assert_eq!(pkt.as_bytes(), &[0, b'a', b'b', 0]);
    }

    #[test]
    fn fixed_string_pads_and_advances_exactly() {
        let mut pkt = PacketWriter::raw();
        pkt.write_fixed_string("hi", 4);
        pkt.write_byte(0xff);
        assert_eq!(pkt.as_bytes(), &[b'h', b'i', 0, 0, 0xff]);

        let mut pkt = PacketWriter::raw();
        pkt.write_fixed_string("toolong", 4);
        assert_eq!(pkt.as_bytes(), b"tool");
        assert_eq!(pkt.position(), 4);
    }

    #[test]
    fn packet_length_is_total_minus_three() {
        let mut pkt = PacketWriter::tcp(0x09);
        pkt.fill(0xaa, 10);
        let len = pkt.write_packet_length();
        assert_eq!(len, 10);
        assert_eq!(pkt.as_bytes()[0], 0);
        assert_eq!(pkt.as_bytes()[1], 10);
        // Cursor stays where the payload ended.
        assert_eq!(pkt.position(), 13);
    }

    #[test]
    fn packet_length_finalize_is_idempotent() {
        let mut pkt = PacketWriter::tcp(0x09);
        pkt.write_int(7);
        let first = pkt.write_packet_length();
        let again = pkt.write_packet_length();
        assert_eq!(first, again);
        assert_eq!(pkt.as_bytes()[1], first as u8);
    }

    #[test]
    fn checksum_skips_reserved_prefix() {
        let mut pkt = PacketWriter::raw();
        pkt.fill(0x7f, 8);
        pkt.write_byte(3);
        pkt.write_byte(4);
        assert_eq!(pkt.checksum(), 7);

        // Changing the prefix never changes the checksum.
        let mut other = PacketWriter::raw();
        other.fill(0x01, 8);
        other.write_byte(3);
        other.write_byte(4);
        assert_eq!(other.checksum(), 7);
    }

    #[test]
    fn checksum_short_buffer_is_zero() {
        let mut pkt = PacketWriter::raw();
        pkt.fill(0xff, 7);
        assert_eq!(pkt.checksum(), 0);
        pkt.write_byte(0xff);
        assert_eq!(pkt.checksum(), 0);
    }

    #[test]
    fn checksum_wraps_additively() {
        let mut pkt = PacketWriter::raw();
        pkt.fill(0, 8);
        pkt.fill(0xff, 3);
        assert_eq!(pkt.checksum(), 0xfdu8);
    }

    #[test]
    fn seek_overwrites_without_growing() {
        let mut pkt = PacketWriter::raw();
        pkt.write_int(0);
        pkt.seek(1);
        pkt.write_byte(0xcc);
        assert_eq!(pkt.as_bytes(), &[0, 0xcc, 0, 0]);
    }

    #[test]
    fn reader_returns_none_past_end() {
        let mut rdr = PacketReader::new(&[0x12, 0x34]);
        assert_eq!(rdr.read_short(), Some(0x1234));
        assert_eq!(rdr.read_byte(), None);
        assert_eq!(rdr.read_short(), None);
    }

    #[test]
    fn reader_pascal_and_c_strings() {
        let mut data = vec![3, b'a', b'b', b'c'];
        data.extend_from_slice(b"def\0tail");
        let mut rdr = PacketReader::new(&data);
        assert_eq!(rdr.read_pascal_string().as_deref(), Some("abc"));
        assert_eq!(rdr.read_c_string().as_deref(), Some("def"));
        assert_eq!(rdr.remaining(), 4);
    }

    #[test]
    fn reader_truncated_pascal_string() {
        let mut rdr = PacketReader::new(&[5, b'a', b'b']);
        assert_eq!(rdr.read_pascal_string(), None);
    }
}
