/// Charset handling for subtitle files found in the wild: UTF-8 (with or
/// without BOM), UTF-16 with BOM, and a WINDOWS-1252 fallback for legacy
/// releases.
#[derive(Debug, Clone)]
pub struct Decoded {
    pub text: String,
    pub encoding: &'static str,
    pub had_bom: bool,
}

pub fn decode(bytes: &[u8]) -> Decoded {
    if bytes.starts_with(&[0xEF, 0xBB, 0xBF]) {
        let (text, _, _) = encoding_rs::UTF_8.decode(bytes);
        return Decoded {
            text: text.into_owned(),
            encoding: "utf-8",
            had_bom: true,
        };
    }
    if bytes.starts_with(&[0xFF, 0xFE]) {
        let (text, _, _) = encoding_rs::UTF_16LE.decode(bytes);
        return Decoded {
            text: text.into_owned(),
            encoding: "utf-16le",
            had_bom: true,
        };
    }
    if bytes.starts_with(&[0xFE, 0xFF]) {
        let (text, _, _) = encoding_rs::UTF_16BE.decode(bytes);
        return Decoded {
            text: text.into_owned(),
            encoding: "utf-16be",
            had_bom: true,
        };
    }
    match std::str::from_utf8(bytes) {
        Ok(text) => Decoded {
            text: text.to_string(),
            encoding: "utf-8",
            had_bom: false,
        },
        Err(_) => {
            let (text, _, _) = encoding_rs::WINDOWS_1252.decode(bytes);
            Decoded {
                text: text.into_owned(),
                encoding: "windows-1252",
                had_bom: false,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_utf8() {
        let decoded = decode("héllo".as_bytes());
        assert_eq!(decoded.encoding, "utf-8");
        assert!(!decoded.had_bom);
        assert_eq!(decoded.text, "héllo");
    }

    #[test]
    fn utf8_bom_is_stripped() {
        let mut bytes = vec![0xEF, 0xBB, 0xBF];
        bytes.extend_from_slice("hello".as_bytes());
        let decoded = decode(&bytes);
        assert!(decoded.had_bom);
        assert_eq!(decoded.text, "hello");
    }

    #[test]
    fn latin1_fallback() {
        // 0xE9 = é in WINDOWS-1252, invalid as standalone UTF-8
        let decoded = decode(&[b'h', 0xE9, b'l', b'l', b'o']);
        assert_eq!(decoded.encoding, "windows-1252");
        assert_eq!(decoded.text, "héllo");
    }

    #[test]
    fn utf16le_with_bom() {
        let mut bytes = vec![0xFF, 0xFE];
        for unit in "hi".encode_utf16() {
            bytes.extend_from_slice(&unit.to_le_bytes());
        }
        let decoded = decode(&bytes);
        assert_eq!(decoded.encoding, "utf-16le");
        assert_eq!(decoded.text, "hi");
    }
}
