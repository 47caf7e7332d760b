//! PDU (Protocol Data Unit) codec.
//!
//! The driver treats PDU generation/parsing as an external collaborator with
//! a fixed interface ([`PduCodec`]). This module ships a real, self-contained
//! implementation of that interface — GSM 03.38/03.40 SMS-SUBMIT encoding and
//! SMS-STATUS-REPORT parsing — grounded on the `pdu` module shape used by
//! `eeeeeta-huawei-modem` (`Pdu`, `DeliverPdu`, `AddressType`) in the reference
//! pack. It intentionally stops at send + status-report parsing: decoding
//! SMS-DELIVER (inbox reading) is a stated Non-goal.

use std::fmt;

/// One part of a (possibly multipart) outgoing SMS, ready to hand to
/// `AT+CMGS=<len>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmsPart {
    /// Length argument for `AT+CMGS=<len>` — the TPDU length in octets,
    /// excluding any SMSC prefix.
    pub tpdu_length: usize,
    /// Hex-encoded `<smsc><tpdu>` bytes, ready to be followed by SUB (0x1A).
    pub smsc_tpdu: String,
}

/// Request to generate one or more [`SmsPart`]s for an outgoing message.
#[derive(Debug, Clone)]
pub struct PduRequest<'a> {
    pub smsc: Option<&'a str>,
    pub receiver: &'a str,
    pub request_status: bool,
    pub text: &'a str,
}

/// A parsed SMS-STATUS-REPORT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedStatusReport {
    /// Message reference (correlates to the short reference from `+CMGS:`).
    pub reference: u8,
    /// TP-Status byte.
    pub status: u8,
}

/// Errors from [`PduCodec::parse`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PduError(pub String);

impl fmt::Display for PduError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pdu error: {}", self.0)
    }
}
impl std::error::Error for PduError {}

/// Fixed interface the engine and SMS coordinator program against.
pub trait PduCodec: Send + Sync {
    /// Generate one TPDU per part. A message that exceeds a single part's
    /// capacity is split with an 8-bit reference concatenation UDH.
    fn generate(&self, request: PduRequest<'_>) -> Vec<SmsPart>;

    /// Parse a raw SMS-STATUS-REPORT PDU (the payload line of a `+CDS:` URC).
    fn parse(&self, raw: &str) -> Result<ParsedStatusReport, PduError>;
}

/// Maximum septets (7-bit packed characters) per part without a UDH.
const GSM7_SINGLE_PART_MAX: usize = 160;
/// Maximum septets per part once a concatenation UDH is present (UDH costs 7
/// septets of the 160 available).
const GSM7_MULTIPART_MAX: usize = 153;
/// Maximum UCS-2 (16-bit) characters per part without a UDH.
const UCS2_SINGLE_PART_MAX: usize = 70;
/// Maximum UCS-2 characters per part once a concatenation UDH is present.
const UCS2_MULTIPART_MAX: usize = 67;

/// GSM 03.38/03.40 codec: 7-bit packing for GSM-alphabet-only text, UCS-2
/// otherwise, SMS-SUBMIT TPDU assembly, SMS-STATUS-REPORT parsing.
#[derive(Debug, Default, Clone, Copy)]
pub struct Gsm0340Codec;

impl Gsm0340Codec {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    fn is_gsm7_alphabet(text: &str) -> bool {
        text.chars().all(|c| (c as u32) < 128)
    }

    fn split_text<'a>(text: &'a str, gsm7: bool) -> Vec<&'a str> {
        let char_count = text.chars().count();
        let single_max = if gsm7 {
            GSM7_SINGLE_PART_MAX
        } else {
            UCS2_SINGLE_PART_MAX
        };
        if char_count <= single_max {
            return vec![text];
        }
        let part_max = if gsm7 {
            GSM7_MULTIPART_MAX
        } else {
            UCS2_MULTIPART_MAX
        };

        let chars: Vec<char> = text.chars().collect();
        let mut parts = Vec::new();
        let mut start_byte = 0usize;
        let mut count = 0usize;
        let mut char_start = 0usize;
        for (idx, ch) in chars.iter().enumerate() {
            count += 1;
            if count == part_max || idx == chars.len() - 1 {
                let end_byte = start_byte
                    + chars[char_start..=idx]
                        .iter()
                        .map(|c| c.len_utf8())
                        .sum::<usize>();
                parts.push(&text[start_byte..end_byte]);
                start_byte = end_byte;
                char_start = idx + 1;
                count = 0;
            }
        }
        parts
    }

    /// Pack 7-bit GSM-alphabet characters into octets per the standard
    /// septet-packing algorithm.
    fn pack_gsm7(text: &str) -> Vec<u8> {
        let septets: Vec<u8> = text.bytes().map(|b| b & 0x7f).collect();
        let mut out = Vec::with_capacity((septets.len() * 7).div_ceil(8));
        let mut bit_buffer: u32 = 0;
        let mut bit_count = 0u32;
        for septet in septets {
            bit_buffer |= u32::from(septet) << bit_count;
            bit_count += 7;
            while bit_count >= 8 {
                out.push((bit_buffer & 0xff) as u8);
                bit_buffer >>= 8;
                bit_count -= 8;
            }
        }
        if bit_count > 0 {
            out.push((bit_buffer & 0xff) as u8);
        }
        out
    }

    fn encode_ucs2(text: &str) -> Vec<u8> {
        let mut out = Vec::with_capacity(text.len() * 2);
        for unit in text.encode_utf16() {
            out.extend_from_slice(&unit.to_be_bytes());
        }
        out
    }

    /// Encode a phone number as a semi-octet BCD address per 3GPP TS 23.040,
    /// returning `(digit_count, type_of_address, semi_octets)`.
    fn encode_address(receiver: &str) -> (usize, u8, Vec<u8>) {
        let international = receiver.starts_with('+');
        let digits: String = receiver.chars().filter(char::is_ascii_digit).collect();
        let type_of_address = if international { 0x91 } else { 0x81 };

        let mut semi_octets = Vec::with_capacity(digits.len().div_ceil(2));
        let mut chars = digits.chars();
        loop {
            let Some(lo) = chars.next() else { break };
            let hi = chars.next().unwrap_or('F');
            let lo_val = lo.to_digit(16).unwrap_or(0) as u8;
            let hi_val = if hi == 'F' {
                0x0f
            } else {
                hi.to_digit(16).unwrap_or(0) as u8
            };
            semi_octets.push((hi_val << 4) | lo_val);
        }
        (digits.len(), type_of_address, semi_octets)
    }

    fn hex(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{b:02X}")).collect()
    }
}

impl PduCodec for Gsm0340Codec {
    fn generate(&self, request: PduRequest<'_>) -> Vec<SmsPart> {
        let gsm7 = Self::is_gsm7_alphabet(request.text);
        let text_parts = Self::split_text(request.text, gsm7);
        let multipart = text_parts.len() > 1;
        // An 8-bit message reference shared by all parts of one multipart send.
        let concat_reference = (request.text.len() as u32 % 256) as u8;

        text_parts
            .iter()
            .enumerate()
            .map(|(idx, part_text)| {
                let mut tpdu = Vec::new();

                // SMSC: either absent (length 0) or the caller-provided override.
                let smsc_octets: Vec<u8> = match request.smsc {
                    None => vec![0x00],
                    Some(smsc) => {
                        let (_, toa, semi) = Self::encode_address(smsc);
                        let mut v = vec![(semi.len() + 1) as u8, toa];
                        v.extend(semi);
                        v
                    }
                };

                // TP-Message-Type-Indicator (SMS-SUBMIT=1) + TP-Reject-Duplicates(0)
                // + TP-Validity-Period-Format (not present) + TP-Status-Report-Request
                // + TP-User-Data-Header-Indicator.
                let mut first_octet = 0x01u8;
                if request.request_status {
                    first_octet |= 0x20;
                }
                if multipart {
                    first_octet |= 0x40;
                }
                tpdu.push(first_octet);

                // TP-Message-Reference: let the modem assign (0).
                tpdu.push(0x00);

                let (digit_count, toa, semi) = Self::encode_address(request.receiver);
                tpdu.push(digit_count as u8);
                tpdu.push(toa);
                tpdu.extend(semi);

                // TP-Protocol-Identifier, TP-Data-Coding-Scheme.
                tpdu.push(0x00);
                tpdu.push(if gsm7 { 0x00 } else { 0x08 });

                let mut user_data = Vec::new();
                if multipart {
                    // UDHL(5) + IEI(0x00) + IEDL(3) + ref + total + seq
                    user_data.push(0x05);
                    user_data.push(0x00);
                    user_data.push(0x03);
                    user_data.push(concat_reference);
                    user_data.push(text_parts.len() as u8);
                    user_data.push((idx + 1) as u8);
                }

                let body = if gsm7 {
                    Self::pack_gsm7(part_text)
                } else {
                    Self::encode_ucs2(part_text)
                };

                let udh_len = user_data.len();
                user_data.extend(body);

                // TP-User-Data-Length: septet count (incl. UDH) for 7-bit,
                // octet count (incl. UDH) for UCS-2/8-bit.
                let udl = if gsm7 {
                    // UDH occupies ceil(udh_len*8/7) septets when present.
                    let udh_septets = if udh_len == 0 {
                        0
                    } else {
                        (udh_len * 8).div_ceil(7)
                    };
                    udh_septets + part_text.chars().count()
                } else {
                    user_data.len()
                };
                tpdu.push(udl as u8);
                tpdu.extend(user_data);

                let smsc_tpdu = Self::hex(&smsc_octets) + &Self::hex(&tpdu);
                SmsPart {
                    tpdu_length: tpdu.len(),
                    smsc_tpdu,
                }
            })
            .collect()
    }

    fn parse(&self, raw: &str) -> Result<ParsedStatusReport, PduError> {
        let bytes = hex_decode(raw).map_err(|e| PduError(format!("invalid hex: {e}")))?;
        // SMSC length prefix, then message-reference is the first TPDU octet
        // after the TP-MTI octet for SMS-STATUS-REPORT (TP-MTI=2).
        let smsc_len = *bytes.first().ok_or_else(|| PduError("empty pdu".into()))? as usize;
        let mut idx = 1 + smsc_len;
        let _first_octet = *bytes
            .get(idx)
            .ok_or_else(|| PduError("truncated pdu (first octet)".into()))?;
        idx += 1;
        let reference = *bytes
            .get(idx)
            .ok_or_else(|| PduError("truncated pdu (reference)".into()))?;
        idx += 1;

        // Recipient address: length (digit count) + type-of-address + semi-octets.
        let addr_digits = *bytes
            .get(idx)
            .ok_or_else(|| PduError("truncated pdu (address length)".into()))?
            as usize;
        idx += 1; // type-of-address
        idx += 1;
        idx += addr_digits.div_ceil(2);

        // TP-Service-Centre-Time-Stamp (7 octets) + TP-Discharge-Time (7 octets).
        idx += 7 + 7;

        let status = *bytes
            .get(idx)
            .ok_or_else(|| PduError("truncated pdu (status)".into()))?;

        Ok(ParsedStatusReport { reference, status })
    }
}

fn hex_decode(s: &str) -> Result<Vec<u8>, String> {
    let s = s.trim();
    if s.len() % 2 != 0 {
        return Err("odd length hex string".to_string());
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).map_err(|e| e.to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_single_part_ascii() {
        let codec = Gsm0340Codec::new();
        let parts = codec.generate(PduRequest {
            smsc: None,
            receiver: "+15551234567",
            request_status: true,
            text: "hello",
        });
        assert_eq!(parts.len(), 1);
        assert!(parts[0].tpdu_length > 0);
        // first octet 0x01 (submit) | 0x20 (status request) = 0x21
        assert!(parts[0].smsc_tpdu.to_uppercase().contains("21"));
    }

    #[test]
    fn generate_splits_long_message() {
        let codec = Gsm0340Codec::new();
        let long_text = "a".repeat(200);
        let parts = codec.generate(PduRequest {
            smsc: None,
            receiver: "15551234567",
            request_status: false,
            text: &long_text,
        });
        assert_eq!(parts.len(), 2);
    }

    #[test]
    fn parse_status_report() {
        let codec = Gsm0340Codec::new();
        // SMSC len=0, first_octet=0x02, ref=0x18(24), addr len=0 digits,
        // toa=0x91, (no semi-octets), 7+7 zero timestamp bytes, status=0x00.
        let mut hex = String::from("00"); // smsc len
        hex += "02"; // first octet (status-report)
        hex += "18"; // reference = 24
        hex += "00"; // address digit count = 0
        hex += "91"; // type of address
        hex += &"00".repeat(7); // service centre timestamp
        hex += &"00".repeat(7); // discharge time
        hex += "00"; // status = delivered
        let parsed = codec.parse(&hex).unwrap();
        assert_eq!(parsed.reference, 24);
        assert_eq!(parsed.status, 0x00);
    }

    #[test]
    fn parse_rejects_bad_hex() {
        let codec = Gsm0340Codec::new();
        assert!(codec.parse("not hex").is_err());
    }
}
