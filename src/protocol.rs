//! Tuya wire protocol implementation.
//! Handles packet framing, header parsing, return codes and CRC/HMAC/GCM verification.

use crate::crypto::{self, GCM_NONCE_LEN, GCM_TAG_LEN, HMAC_LEN, TuyaCipher};
use crate::error::{Result, TuyaError};
use byteorder::{BigEndian, ByteOrder, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

pub const PREFIX_55AA: u32 = 0x000055AA;
pub const PREFIX_6699: u32 = 0x00006699;
pub const SUFFIX_55AA: u32 = 0x0000AA55;
pub const SUFFIX_6699: u32 = 0x00009966;

/// Prefix(4) + Seq(4) + Cmd(4) + Len(4)
pub const HEADER_LEN_55AA: usize = 16;
/// Prefix(4) + Reserved(2) + Seq(4) + Cmd(4) + Len(4)
pub const HEADER_LEN_6699: usize = 18;
pub const SUFFIX_LEN: usize = 4;
pub const CRC_LEN: usize = 4;
pub const RETCODE_LEN: usize = 4;
/// Upper bound on the length field; anything larger is treated as desynchronisation.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

define_command_type! {
    ApConfig = 0x01,
    Active = 0x02,
    SessKeyNegStart = 0x03,
    SessKeyNegResp = 0x04,
    SessKeyNegFinish = 0x05,
    Unbind = 0x06,
    Control = 0x07,
    Status = 0x08,
    HeartBeat = 0x09,
    DpQuery = 0x0a,
    QueryWifi = 0x0b,
    TokenBind = 0x0c,
    ControlNew = 0x0d,
    EnableWifi = 0x0e,
    WifiInfo = 0x0f,
    DpQueryNew = 0x10,
    SceneExecute = 0x11,
    UpdateDps = 0x12,
    UdpNew = 0x13,
    ApConfigNew = 0x14,
    ReqDevInfo = 0x25,
    LanExtStream = 0x40,
}

define_version! {
    V3_1 = "3.1",
    V3_3 = "3.3",
    V3_4 = "3.4",
    V3_5 = "3.5",
}

impl Version {
    /// Versions that negotiate a session key before any other traffic.
    pub fn requires_negotiation(&self) -> bool {
        *self >= Version::V3_4
    }

    /// Frame prefix used when sending.
    pub fn prefix(&self) -> u32 {
        if *self >= Version::V3_5 {
            PREFIX_6699
        } else {
            PREFIX_55AA
        }
    }

    /// Whether 55AA frames carry an HMAC-SHA256 instead of a CRC32.
    pub fn uses_hmac(&self) -> bool {
        *self == Version::V3_4
    }
}

/// Tuya protocol message structure as it appears between header and footer.
///
/// For 55AA frames `payload` is the on-wire body (possibly ECB ciphertext).
/// For 6699 frames it is the GCM plaintext; encryption is part of framing.
#[derive(Debug, Clone, PartialEq)]
pub struct TuyaMessage {
    /// Sequence number
    pub seqno: u32,
    /// Command code
    pub cmd: CommandType,
    /// Return code (device replies only)
    pub retcode: Option<u32>,
    /// Payload bytes
    pub payload: Vec<u8>,
    /// Protocol prefix (0x55AA or 0x6699)
    pub prefix: u32,
    /// GCM IV for 6699 frames; generated at random when packing without one
    pub iv: Option<[u8; GCM_NONCE_LEN]>,
}

impl Default for TuyaMessage {
    fn default() -> Self {
        Self {
            seqno: 0,
            cmd: CommandType::HeartBeat,
            retcode: None,
            payload: Vec::new(),
            prefix: PREFIX_55AA,
            iv: None,
        }
    }
}

/// Tuya protocol header structure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TuyaHeader {
    /// Protocol prefix
    pub prefix: u32,
    /// Sequence number
    pub seqno: u32,
    /// Command code
    pub cmd: u32,
    /// Length field: everything after the header (body + checksum/tag + suffix)
    pub payload_len: u32,
    /// Total message length (header + payload)
    pub total_length: usize,
}

impl TuyaHeader {
    pub fn header_len(&self) -> usize {
        if self.prefix == PREFIX_6699 {
            HEADER_LEN_6699
        } else {
            HEADER_LEN_55AA
        }
    }
}

/// Header length implied by the first four bytes, if they are a known prefix.
pub fn header_len_for_prefix(prefix: u32) -> Option<usize> {
    match prefix {
        PREFIX_55AA => Some(HEADER_LEN_55AA),
        PREFIX_6699 => Some(HEADER_LEN_6699),
        _ => None,
    }
}

/// Pack TuyaMessage into binary data.
///
/// 55AA: `hmac_key` selects HMAC-SHA256, otherwise CRC32.
/// 6699: `hmac_key` is the GCM key and is mandatory.
pub fn pack_message(msg: &TuyaMessage, hmac_key: Option<&[u8]>) -> Result<Vec<u8>> {
    let mut data = Vec::new();

    match msg.prefix {
        PREFIX_55AA => {
            let footer_len = if hmac_key.is_some() {
                HMAC_LEN + SUFFIX_LEN
            } else {
                CRC_LEN + SUFFIX_LEN
            };
            let retcode_len = msg.retcode.map_or(0, |_| RETCODE_LEN);
            let payload_len = retcode_len + msg.payload.len() + footer_len;

            data.write_u32::<BigEndian>(PREFIX_55AA)?;
            data.write_u32::<BigEndian>(msg.seqno)?;
            data.write_u32::<BigEndian>(msg.cmd.code())?;
            data.write_u32::<BigEndian>(payload_len as u32)?;
            if let Some(rc) = msg.retcode {
                data.write_u32::<BigEndian>(rc)?;
            }
            data.extend_from_slice(&msg.payload);

            // Footer (checksum + suffix)
            if let Some(key) = hmac_key {
                data.extend_from_slice(&crypto::hmac_sha256(key, &data)?);
            } else {
                let crc_val = crypto::crc32(&data);
                data.write_u32::<BigEndian>(crc_val)?;
            }
            data.write_u32::<BigEndian>(SUFFIX_55AA)?;
        }
        PREFIX_6699 => {
            let key = hmac_key.ok_or(TuyaError::EncryptionFailed)?;

            let mut raw = Vec::with_capacity(RETCODE_LEN + msg.payload.len());
            if let Some(rc) = msg.retcode {
                raw.write_u32::<BigEndian>(rc)?;
            }
            raw.extend_from_slice(&msg.payload);

            let total_payload_len = GCM_NONCE_LEN + raw.len() + GCM_TAG_LEN + SUFFIX_LEN;

            data.write_u32::<BigEndian>(PREFIX_6699)?;
            data.write_u16::<BigEndian>(0)?; // Reserved
            data.write_u32::<BigEndian>(msg.seqno)?;
            data.write_u32::<BigEndian>(msg.cmd.code())?;
            data.write_u32::<BigEndian>(total_payload_len as u32)?;

            let iv = msg.iv.unwrap_or_else(|| {
                let mut iv = [0u8; GCM_NONCE_LEN];
                rand::RngCore::fill_bytes(&mut rand::rng(), &mut iv);
                iv
            });

            // GCM Encryption (AAD = Header[4..])
            let cipher = TuyaCipher::new(key)?;
            let (ciphertext, tag) = cipher.encrypt_gcm(&iv, &raw, &data[4..HEADER_LEN_6699])?;

            data.extend_from_slice(&iv);
            data.extend_from_slice(&ciphertext);
            data.extend_from_slice(&tag);
            data.write_u32::<BigEndian>(SUFFIX_6699)?;
        }
        other => {
            return Err(TuyaError::Framing(format!(
                "cannot pack unknown prefix 0x{:08X}",
                other
            )));
        }
    }

    Ok(data)
}

/// Parse Tuya header from binary data.
pub fn parse_header(data: &[u8]) -> Result<TuyaHeader> {
    if data.len() < HEADER_LEN_55AA {
        return Err(TuyaError::Decode("Header too short".into()));
    }

    let mut cursor = Cursor::new(data);
    let prefix = cursor.read_u32::<BigEndian>()?;

    let header_len = match prefix {
        PREFIX_55AA => HEADER_LEN_55AA,
        PREFIX_6699 => {
            if data.len() < HEADER_LEN_6699 {
                return Err(TuyaError::Decode("6699 header too short".into()));
            }
            let _reserved = cursor.read_u16::<BigEndian>()?;
            HEADER_LEN_6699
        }
        _ => return Err(TuyaError::InvalidHeader),
    };

    let seqno = cursor.read_u32::<BigEndian>()?;
    let cmd = cursor.read_u32::<BigEndian>()?;
    let payload_len = cursor.read_u32::<BigEndian>()?;

    if payload_len as usize > MAX_FRAME_LEN {
        return Err(TuyaError::Framing(format!(
            "length field {} exceeds {}",
            payload_len, MAX_FRAME_LEN
        )));
    }

    Ok(TuyaHeader {
        prefix,
        seqno,
        cmd,
        payload_len,
        total_length: header_len + payload_len as usize,
    })
}

/// Splits a leading return code off a device reply.
///
/// Return codes are small integers, so a lead word with any of its upper 24 bits
/// set is taken to be payload (JSON, a version header or ciphertext).
fn split_retcode(body: &[u8]) -> (Option<u32>, &[u8]) {
    if body.len() >= RETCODE_LEN {
        let lead = BigEndian::read_u32(&body[..RETCODE_LEN]);
        if lead & 0xFFFF_FF00 == 0 {
            return (Some(lead), &body[RETCODE_LEN..]);
        }
    }
    (None, body)
}

/// Unpack one complete frame into a TuyaMessage, verifying suffix and integrity.
pub fn unpack_message(
    data: &[u8],
    hmac_key: Option<&[u8]>,
    header: Option<TuyaHeader>,
) -> Result<TuyaMessage> {
    let header = match header {
        Some(h) => h,
        None => parse_header(data)?,
    };

    let msg_len = header.total_length;
    if data.len() < msg_len {
        return Err(TuyaError::Decode("Data shorter than expected".into()));
    }

    let expected_suffix = if header.prefix == PREFIX_6699 {
        SUFFIX_6699
    } else {
        SUFFIX_55AA
    };
    let suffix = BigEndian::read_u32(&data[msg_len - SUFFIX_LEN..msg_len]);
    if suffix != expected_suffix {
        return Err(TuyaError::Framing(format!(
            "suffix 0x{:08X} does not match prefix 0x{:08X}",
            suffix, header.prefix
        )));
    }

    match header.prefix {
        PREFIX_55AA => {
            let check_len = if hmac_key.is_some() { HMAC_LEN } else { CRC_LEN };
            let header_len = HEADER_LEN_55AA;
            if msg_len < header_len + check_len + SUFFIX_LEN {
                return Err(TuyaError::Framing(format!(
                    "length field {} shorter than footer",
                    header.payload_len
                )));
            }
            let payload_end = msg_len - check_len - SUFFIX_LEN;

            // Verify checksum (CRC/HMAC) over header + body
            let checksum_data = &data[..payload_end];
            let footer = &data[payload_end..payload_end + check_len];

            if let Some(key) = hmac_key {
                if !crypto::verify_hmac_sha256(key, checksum_data, footer)? {
                    return Err(TuyaError::HmacMismatch);
                }
            } else {
                let calc_crc = crypto::crc32(checksum_data);
                let recv_crc = BigEndian::read_u32(footer);
                if calc_crc != recv_crc {
                    return Err(TuyaError::CrcMismatch);
                }
            }

            let (retcode, payload) = split_retcode(&data[header_len..payload_end]);

            Ok(TuyaMessage {
                seqno: header.seqno,
                cmd: CommandType::from_u32(header.cmd),
                retcode,
                payload: payload.to_vec(),
                prefix: header.prefix,
                iv: None,
            })
        }
        PREFIX_6699 => {
            let key = hmac_key.ok_or(TuyaError::EncryptionFailed)?;
            let header_len = HEADER_LEN_6699;
            let body = &data[header_len..msg_len - SUFFIX_LEN];

            if body.len() < GCM_NONCE_LEN + GCM_TAG_LEN {
                return Err(TuyaError::Framing(format!(
                    "length field {} shorter than IV and tag",
                    header.payload_len
                )));
            }

            let (iv, rest) = body.split_at(GCM_NONCE_LEN);
            let (ciphertext, tag) = rest.split_at(rest.len() - GCM_TAG_LEN);

            // GCM Decryption (AAD = Header[4..])
            let cipher = TuyaCipher::new(key)?;
            let plaintext = cipher.decrypt_gcm(iv, ciphertext, tag, &data[4..header_len])?;

            let (retcode, payload) = split_retcode(&plaintext);
            let mut iv_bytes = [0u8; GCM_NONCE_LEN];
            iv_bytes.copy_from_slice(iv);

            Ok(TuyaMessage {
                seqno: header.seqno,
                cmd: CommandType::from_u32(header.cmd),
                retcode,
                payload: payload.to_vec(),
                prefix: header.prefix,
                iv: Some(iv_bytes),
            })
        }
        _ => Err(TuyaError::InvalidHeader),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    const KEY: &[u8] = b"5c8c3ccc1f0fbdbb";

    #[test]
    fn command_codes_round_trip_and_preserve_unknown() {
        assert_eq!(CommandType::from_u32(0x0a), CommandType::DpQuery);
        assert_eq!(CommandType::DpQueryNew.code(), 0x10);
        assert_eq!(CommandType::from_u32(0x77), CommandType::Unknown(0x77));
        assert_eq!(CommandType::Unknown(0x77).code(), 0x77);
    }

    #[test]
    fn versions_are_ordered_and_parsed() {
        assert!(Version::V3_1 < Version::V3_3);
        assert!(Version::V3_4 < Version::V3_5);
        assert_eq!("3.4".parse::<Version>().unwrap(), Version::V3_4);
        assert_eq!(Version::V3_5.to_string(), "3.5");
        assert!(matches!(
            "3.9".parse::<Version>(),
            Err(TuyaError::InvalidVersion(_))
        ));
        assert!(!Version::V3_3.requires_negotiation());
        assert!(Version::V3_4.requires_negotiation());
    }

    #[test]
    fn pack_v34_negotiation_start_matches_capture() {
        // Payload is the ECB encryption of a 16-byte local nonce.
        let payload = crypto::encrypt_ecb(KEY, &hex!("47f877066f5983df0681e1f08be9f1a1")).unwrap();
        let msg = TuyaMessage {
            seqno: 1,
            cmd: CommandType::SessKeyNegStart,
            payload,
            ..Default::default()
        };
        let packed = pack_message(&msg, Some(KEY)).unwrap();
        assert_eq!(
            packed,
            hex!(
                "000055aa000000010000000300000044af06484eb01c2272666a10953aaa23e8"
                "9328e42ea1f29fd0eca40999ab964927c99646647abb2ab242062a7e91195319"
                "5ae99b2ee79fa00a95da8cc67e0b42e20000aa55"
            )
        );
    }

    #[test]
    fn unpack_v34_negotiation_response_from_device() {
        let packet = hex!(
            "000055aa0000fc6c0000000400000068000000004b578f442ec0802f26ca6794"
            "389ce4ebf57f94561e9367569b0ff90afebe08765460b35678102c0a96b666a6"
            "f6a3aabf9328e42ea1f29fd0eca40999ab964927c340dba68f847cb840b473c1"
            "9572f8de9e222de2d5b1793dc7d4888a8b4f11b00000aa55"
        );
        let msg = unpack_message(&packet, Some(KEY), None).unwrap();
        assert_eq!(msg.seqno, 0xfc6c);
        assert_eq!(msg.cmd, CommandType::SessKeyNegResp);
        assert_eq!(msg.retcode, Some(0));
        assert_eq!(msg.payload.len(), 64);

        let plaintext = crypto::decrypt_ecb(KEY, &msg.payload).unwrap();
        assert_eq!(
            plaintext,
            hex!(
                "3965333963353564643232333163336605ca4f27a567a763d0df1ed6c34fa5bb"
                "334a604d900cc86b8085eef6acd0193d"
            )
        );
    }

    #[test]
    fn unpack_rejects_bad_suffix_before_checksum() {
        let msg = TuyaMessage {
            seqno: 3,
            cmd: CommandType::HeartBeat,
            payload: b"{}".to_vec(),
            ..Default::default()
        };
        let mut packed = pack_message(&msg, None).unwrap();
        let n = packed.len();
        packed[n - 1] = 0x56;
        assert!(matches!(
            unpack_message(&packed, None, None),
            Err(TuyaError::Framing(_))
        ));
    }

    #[test]
    fn retcode_survives_55aa_and_6699() {
        let msg = TuyaMessage {
            seqno: 9,
            cmd: CommandType::Status,
            retcode: Some(0),
            payload: b"{\"dps\":{\"1\":true}}".to_vec(),
            ..Default::default()
        };
        let packed = pack_message(&msg, None).unwrap();
        let back = unpack_message(&packed, None, None).unwrap();
        assert_eq!(back, msg);

        let msg = TuyaMessage {
            prefix: PREFIX_6699,
            iv: Some([0x11; 12]),
            ..msg
        };
        let packed = pack_message(&msg, Some(KEY)).unwrap();
        let back = unpack_message(&packed, Some(KEY), None).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn parse_header_rejects_oversized_length() {
        let mut header = Vec::new();
        header.extend_from_slice(&PREFIX_55AA.to_be_bytes());
        header.extend_from_slice(&1u32.to_be_bytes());
        header.extend_from_slice(&9u32.to_be_bytes());
        header.extend_from_slice(&((MAX_FRAME_LEN as u32) + 1).to_be_bytes());
        assert!(matches!(parse_header(&header), Err(TuyaError::Framing(_))));
    }

    #[test]
    fn parse_header_rejects_unknown_prefix() {
        let header = [0xde, 0xad, 0xbe, 0xef, 0, 0, 0, 1, 0, 0, 0, 9, 0, 0, 0, 8];
        assert_eq!(parse_header(&header), Err(TuyaError::InvalidHeader));
    }
}
