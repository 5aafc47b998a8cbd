// ── SMS / USSD payload codecs ──
//
// Decodes the hex-encoded TPDUs the AT command set hands back: SMS-DELIVER
// payloads from `+CMGL`/`+CMGR` (GSM 7-bit and UCS-2 alphabets, concatenation
// headers) and UCS-2 USSD notification bodies. Encoding is limited to the
// 7-bit packing `AT+CUSD` requires; message composition is out of scope.

use chrono::{DateTime, FixedOffset, TimeZone};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PduError {
    #[error("invalid hex payload at offset {offset}")]
    InvalidHex { offset: usize },

    #[error("truncated PDU: needed {needed} more byte(s) for {context}")]
    Truncated {
        context: &'static str,
        needed: usize,
    },

    #[error("unsupported data coding scheme 0x{dcs:02X}")]
    UnsupportedCoding { dcs: u8 },

    #[error("character {0:?} not representable in the GSM 7-bit alphabet")]
    Unencodable(char),

    #[error("invalid UCS-2 payload")]
    InvalidUcs2,
}

/// Concatenated-SMS header fields from the UDH.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConcatInfo {
    /// Reference number shared by every part of one logical message.
    pub reference: u16,
    /// Declared total part count.
    pub total: u8,
    /// 1-based index of this part.
    pub index: u8,
}

/// A decoded SMS-DELIVER payload.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedSms {
    pub sender: String,
    pub text: String,
    pub timestamp: Option<DateTime<FixedOffset>>,
    pub dcs: u8,
    pub udh: Option<ConcatInfo>,
}

// ── SMS-DELIVER ──────────────────────────────────────────────────────

/// Decode the hex payload line of an SMS-DELIVER TPDU (as listed by
/// `AT+CMGL` in PDU mode, SMSC prefix included).
pub fn decode_sms_deliver(hex: &str) -> Result<DecodedSms, PduError> {
    let bytes = decode_hex(hex.trim())?;
    let mut r = Reader::new(&bytes);

    // SMSC address block, length-prefixed in octets.
    let smsc_len = r.u8("SMSC length")? as usize;
    r.skip(smsc_len, "SMSC address")?;

    let first_octet = r.u8("first octet")?;
    let has_udh = first_octet & 0x40 != 0;

    // Originating address: digit count, type-of-address, swapped semi-octets.
    let addr_digits = r.u8("address length")? as usize;
    let toa = r.u8("type of address")?;
    let addr = r.take(addr_digits.div_ceil(2), "originating address")?;
    let sender = decode_address(addr, addr_digits, toa);

    let _pid = r.u8("protocol id")?;
    let dcs = r.u8("data coding scheme")?;
    let scts = r.take(7, "service centre timestamp")?;
    let timestamp = decode_timestamp(scts);

    let udl = r.u8("user data length")? as usize;
    let ud = r.rest();

    let (udh, udh_octets) = if has_udh {
        let udhl = *ud.first().ok_or(PduError::Truncated {
            context: "UDH length",
            needed: 1,
        })? as usize;
        if ud.len() < 1 + udhl {
            return Err(PduError::Truncated {
                context: "UDH",
                needed: 1 + udhl - ud.len(),
            });
        }
        (parse_concat_header(&ud[1..1 + udhl]), 1 + udhl)
    } else {
        (None, 0)
    };

    let text = match dcs & 0x0C {
        // GSM 7-bit default alphabet.
        0x00 => {
            let udh_bits = udh_octets * 8;
            // Text septets start on the next septet boundary after the UDH.
            let start_bit = udh_bits.div_ceil(7) * 7;
            let septets = udl.saturating_sub(start_bit / 7);
            unpack_gsm7(ud, start_bit, septets)
        }
        // UCS-2; UDL counts octets here.
        0x08 => {
            let end = udl.min(ud.len());
            decode_ucs2_bytes(&ud[udh_octets..end])?
        }
        _ => return Err(PduError::UnsupportedCoding { dcs }),
    };

    Ok(DecodedSms {
        sender,
        text,
        timestamp,
        dcs,
        udh,
    })
}

/// Scan the UDH information elements for a concatenation header
/// (IEI 0x00: 8-bit reference, IEI 0x08: 16-bit reference).
fn parse_concat_header(mut ies: &[u8]) -> Option<ConcatInfo> {
    while let [iei, len, rest @ ..] = ies {
        let len = *len as usize;
        if rest.len() < len {
            return None;
        }
        let (data, tail) = rest.split_at(len);
        match (iei, data) {
            (0x00, [reference, total, index]) => {
                return Some(ConcatInfo {
                    reference: u16::from(*reference),
                    total: *total,
                    index: *index,
                });
            }
            (0x08, [hi, lo, total, index]) => {
                return Some(ConcatInfo {
                    reference: u16::from_be_bytes([*hi, *lo]),
                    total: *total,
                    index: *index,
                });
            }
            _ => ies = tail,
        }
    }
    None
}

// ── USSD ─────────────────────────────────────────────────────────────

/// Pack a USSD request string into the hex form `AT+CUSD=1` expects.
pub fn encode_ussd(text: &str) -> Result<String, PduError> {
    let septets: Vec<u8> = text
        .chars()
        .map(|c| gsm7_index(c).ok_or(PduError::Unencodable(c)))
        .collect::<Result<_, _>>()?;
    Ok(encode_hex(&pack_gsm7(&septets)))
}

/// Decode a UCS-2 hex body from a `+CUSD` notification.
pub fn decode_ucs2(hex: &str) -> Result<String, PduError> {
    decode_ucs2_bytes(&decode_hex(hex.trim())?)
}

// ── Hex helpers ──────────────────────────────────────────────────────

// Byte-wise so that stray non-ASCII input is an error, not a slicing
// panic: PDU text arrives over the same unreliable line as everything else.
fn decode_hex(hex: &str) -> Result<Vec<u8>, PduError> {
    let bytes = hex.as_bytes();
    if bytes.len() % 2 != 0 {
        return Err(PduError::InvalidHex { offset: bytes.len() });
    }
    bytes
        .chunks_exact(2)
        .enumerate()
        .map(|(i, pair)| match (hex_digit(pair[0]), hex_digit(pair[1])) {
            (Some(hi), Some(lo)) => Ok(hi << 4 | lo),
            _ => Err(PduError::InvalidHex { offset: i * 2 }),
        })
        .collect()
}

fn hex_digit(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

fn encode_hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    bytes.iter().fold(String::new(), |mut s, b| {
        let _ = write!(s, "{b:02X}");
        s
    })
}

// ── Address / timestamp decoding ─────────────────────────────────────

fn decode_address(bytes: &[u8], digits: usize, toa: u8) -> String {
    // Alphanumeric addresses are GSM 7-bit packed into the digit field.
    if toa & 0x70 == 0x50 {
        return unpack_gsm7(bytes, 0, digits * 4 / 7);
    }

    let mut out = String::with_capacity(digits + 1);
    if toa & 0x70 == 0x10 {
        out.push('+');
    }
    for (i, b) in bytes.iter().enumerate() {
        for nibble in [b & 0x0F, b >> 4] {
            if 2 * i + usize::from(nibble == b >> 4) >= digits {
                continue;
            }
            out.push(match nibble {
                0..=9 => (b'0' + nibble) as char,
                0x0A => '*',
                0x0B => '#',
                0x0C => 'a',
                0x0D => 'b',
                0x0E => 'c',
                _ => continue, // 0xF filler
            });
        }
    }
    out
}

/// Swapped-BCD service centre timestamp: yy mm dd hh mm ss tz, timezone in
/// quarter-hours with the sign in bit 3 of the leading digit. Anything that
/// does not form a valid date degrades to `None`.
fn decode_timestamp(scts: &[u8]) -> Option<DateTime<FixedOffset>> {
    let bcd = |b: u8| -> Option<u32> {
        let (lo, hi) = (b & 0x0F, b >> 4);
        (lo <= 9 && hi <= 9).then(|| u32::from(lo) * 10 + u32::from(hi))
    };

    let year = 2000 + bcd(scts[0])? as i32;
    let month = bcd(scts[1])?;
    let day = bcd(scts[2])?;
    let hour = bcd(scts[3])?;
    let minute = bcd(scts[4])?;
    let second = bcd(scts[5])?;

    let tz = scts[6];
    let quarters = i32::from(tz & 0x07) * 10 + i32::from(tz >> 4);
    let mut offset_secs = quarters * 15 * 60;
    if tz & 0x08 != 0 {
        offset_secs = -offset_secs;
    }

    FixedOffset::east_opt(offset_secs)?
        .with_ymd_and_hms(year, month, day, hour, minute, second)
        .single()
}

// ── GSM 7-bit default alphabet ───────────────────────────────────────

const GSM7_ESCAPE: u8 = 0x1B;

#[rustfmt::skip]
const GSM7_ALPHABET: [char; 128] = [
    '@', '£', '$', '¥', 'è', 'é', 'ù', 'ì', 'ò', 'Ç', '\n', 'Ø', 'ø', '\r', 'Å', 'å',
    'Δ', '_', 'Φ', 'Γ', 'Λ', 'Ω', 'Π', 'Ψ', 'Σ', 'Θ', 'Ξ', '\u{1b}', 'Æ', 'æ', 'ß', 'É',
    ' ', '!', '"', '#', '¤', '%', '&', '\'', '(', ')', '*', '+', ',', '-', '.', '/',
    '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', ':', ';', '<', '=', '>', '?',
    '¡', 'A', 'B', 'C', 'D', 'E', 'F', 'G', 'H', 'I', 'J', 'K', 'L', 'M', 'N', 'O',
    'P', 'Q', 'R', 'S', 'T', 'U', 'V', 'W', 'X', 'Y', 'Z', 'Ä', 'Ö', 'Ñ', 'Ü', '§',
    '¿', 'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i', 'j', 'k', 'l', 'm', 'n', 'o',
    'p', 'q', 'r', 's', 't', 'u', 'v', 'w', 'x', 'y', 'z', 'ä', 'ö', 'ñ', 'ü', 'à',
];

const GSM7_EXTENSION: &[(u8, char)] = &[
    (0x0A, '\u{0C}'),
    (0x14, '^'),
    (0x28, '{'),
    (0x29, '}'),
    (0x2F, '\\'),
    (0x3C, '['),
    (0x3D, '~'),
    (0x3E, ']'),
    (0x40, '|'),
    (0x65, '€'),
];

fn gsm7_index(c: char) -> Option<u8> {
    GSM7_ALPHABET
        .iter()
        .position(|&g| g == c)
        .map(|i| i as u8)
        .filter(|&i| i != GSM7_ESCAPE)
}

/// Unpack `count` septets starting at `start_bit` (LSB-first packing).
fn unpack_gsm7(data: &[u8], start_bit: usize, count: usize) -> String {
    let mut out = String::with_capacity(count);
    let mut escaped = false;

    for i in 0..count {
        let bit = start_bit + i * 7;
        let idx = bit / 8;
        if idx >= data.len() {
            break;
        }
        let shift = bit % 8;
        let mut v = u16::from(data[idx]) >> shift;
        if idx + 1 < data.len() {
            v |= u16::from(data[idx + 1]) << (8 - shift);
        }
        let septet = (v & 0x7F) as u8;

        if escaped {
            escaped = false;
            if let Some(&(_, c)) = GSM7_EXTENSION.iter().find(|&&(code, _)| code == septet) {
                out.push(c);
            }
        } else if septet == GSM7_ESCAPE {
            escaped = true;
        } else {
            out.push(GSM7_ALPHABET[septet as usize]);
        }
    }
    out
}

/// Pack septets LSB-first into octets.
fn pack_gsm7(septets: &[u8]) -> Vec<u8> {
    let mut out = vec![0u8; (septets.len() * 7).div_ceil(8)];
    for (i, &s) in septets.iter().enumerate() {
        let bit = i * 7;
        let idx = bit / 8;
        let shift = bit % 8;
        out[idx] |= s << shift;
        if shift > 1 {
            out[idx + 1] |= s >> (8 - shift);
        }
    }
    out
}

// ── UCS-2 ────────────────────────────────────────────────────────────

fn decode_ucs2_bytes(bytes: &[u8]) -> Result<String, PduError> {
    if bytes.len() % 2 != 0 {
        return Err(PduError::InvalidUcs2);
    }
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|c| u16::from_be_bytes([c[0], c[1]]))
        .collect();
    String::from_utf16(&units).map_err(|_| PduError::InvalidUcs2)
}

// ── Byte reader ──────────────────────────────────────────────────────

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn u8(&mut self, context: &'static str) -> Result<u8, PduError> {
        let b = *self.data.get(self.pos).ok_or(PduError::Truncated {
            context,
            needed: 1,
        })?;
        self.pos += 1;
        Ok(b)
    }

    fn take(&mut self, n: usize, context: &'static str) -> Result<&'a [u8], PduError> {
        if self.data.len() < self.pos + n {
            return Err(PduError::Truncated {
                context,
                needed: self.pos + n - self.data.len(),
            });
        }
        let s = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn skip(&mut self, n: usize, context: &'static str) -> Result<(), PduError> {
        self.take(n, context).map(|_| ())
    }

    fn rest(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    // "hello" packed: septets 68 65 6C 6C 6F -> E8 32 9B FD 06
    const HELLO_GSM7: &str = "E8329BFD06";

    #[test]
    fn gsm7_pack_round_trip() {
        assert_eq!(encode_ussd("hello").unwrap(), HELLO_GSM7);
    }

    #[test]
    fn gsm7_unpack_known_vector() {
        // "hellohello", the canonical 10-septet example.
        let data = decode_hex("E8329BFD4697D9EC37").unwrap();
        assert_eq!(unpack_gsm7(&data, 0, 10), "hellohello");
    }

    #[test]
    fn ucs2_decodes_big_endian_units() {
        assert_eq!(decode_ucs2("00480065006C006C006F").unwrap(), "Hello");
    }

    #[test]
    fn ucs2_rejects_odd_length() {
        assert_eq!(decode_ucs2("004800"), Err(PduError::InvalidUcs2));
    }

    #[test]
    fn encode_rejects_non_gsm_characters() {
        assert_eq!(encode_ussd("日本"), Err(PduError::Unencodable('日')));
    }

    /// Assemble an SMS-DELIVER TPDU for tests. Sender is +79161234567,
    /// timestamp 2024-06-15 12:30:45 +03:00 (12 quarter-hours: digits "12",
    /// swapped BCD -> 0x21).
    fn deliver(first_octet: u8, dcs: u8, ud: &[u8], udl: u8) -> String {
        let mut pdu: Vec<u8> = vec![
            0x00, // no SMSC prefix
            first_octet,
            0x0B, // 11 address digits
            0x91, // international
            0x97, 0x61, 0x21, 0x43, 0x65, 0xF7, // 79161234567, F-padded
            0x00, // PID
            dcs,
            0x42, 0x60, 0x51, 0x21, 0x03, 0x54, 0x21, // SCTS
            udl,
        ];
        pdu.extend_from_slice(ud);
        encode_hex(&pdu)
    }

    #[test]
    fn deliver_gsm7_decodes_sender_text_and_timestamp() {
        let ud = decode_hex(HELLO_GSM7).unwrap();
        let sms = decode_sms_deliver(&deliver(0x04, 0x00, &ud, 5)).unwrap();

        assert_eq!(sms.sender, "+79161234567");
        assert_eq!(sms.text, "hello");
        assert_eq!(sms.udh, None);

        let ts = sms.timestamp.expect("timestamp");
        assert_eq!(ts.to_rfc3339(), "2024-06-15T12:30:45+03:00");
    }

    #[test]
    fn deliver_ucs2_decodes_text() {
        let ud = decode_hex("041F04400438043204350442").unwrap(); // "Привет"
        let sms = decode_sms_deliver(&deliver(0x04, 0x08, &ud, 12)).unwrap();
        assert_eq!(sms.text, "Привет");
        assert_eq!(sms.dcs, 0x08);
    }

    #[test]
    fn deliver_with_concat_udh() {
        // UDH: len 5, IEI 0x00, len 3, ref 7, total 2, index 1.
        // 6 octets of header = 48 bits, padded to the 49-bit septet boundary,
        // so text septets start at septet 7.
        let mut ud = vec![0x05, 0x00, 0x03, 0x07, 0x02, 0x01];
        let text = pack_gsm7(&[0, 0, 0, 0, 0, 0, 0, b'H', b'i']);
        ud.extend_from_slice(&text[6..]);

        let sms = decode_sms_deliver(&deliver(0x44, 0x00, &ud, 9)).unwrap();
        assert_eq!(
            sms.udh,
            Some(ConcatInfo {
                reference: 7,
                total: 2,
                index: 1,
            })
        );
        assert_eq!(sms.text, "Hi");
    }

    #[test]
    fn deliver_sixteen_bit_reference() {
        // IEI 0x08: ref 0x0102, total 3, index 2. UDH len 6 -> 7 octets,
        // 56 bits == 8 septets exactly, no padding.
        let mut ud = vec![0x06, 0x08, 0x04, 0x01, 0x02, 0x03, 0x02];
        let text = pack_gsm7(&[0, 0, 0, 0, 0, 0, 0, 0, b'o', b'k']);
        ud.extend_from_slice(&text[7..]);

        let sms = decode_sms_deliver(&deliver(0x44, 0x00, &ud, 10)).unwrap();
        assert_eq!(
            sms.udh,
            Some(ConcatInfo {
                reference: 0x0102,
                total: 3,
                index: 2,
            })
        );
        assert_eq!(sms.text, "ok");
    }

    #[test]
    fn truncated_pdu_reports_context() {
        let err = decode_sms_deliver("0004").unwrap_err();
        assert!(matches!(err, PduError::Truncated { .. }));
    }

    #[test]
    fn unsupported_coding_scheme_is_rejected() {
        let err = decode_sms_deliver(&deliver(0x04, 0x04, &[0xFF], 1)).unwrap_err();
        assert_eq!(err, PduError::UnsupportedCoding { dcs: 0x04 });
    }

    #[test]
    fn non_ascii_hex_is_an_error_not_a_panic() {
        // Garbled serial input can interleave multi-byte characters with
        // hex digits; the decoder must report it, not die mid-slice.
        assert_eq!(
            decode_sms_deliver("aéb").unwrap_err(),
            PduError::InvalidHex { offset: 0 }
        );
        assert_eq!(
            decode_ucs2("00éé").unwrap_err(),
            PduError::InvalidHex { offset: 2 }
        );
    }
}
