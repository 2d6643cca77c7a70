use sha2::{Digest, Sha256};
use std::{
    fs::{self, File},
    io::Read,
    path::PathBuf,
};

pub fn walk_recursive<F>(
    folder: &PathBuf,
    filter_fn: Option<F>,
) -> Result<Vec<PathBuf>, std::io::Error>
where
    F: Fn(&PathBuf) -> bool + std::marker::Copy,
{
    let mut local_paths = Vec::new();
    let dir = fs::read_dir(folder)?;
    for file in dir {
        let path = file?.path();
        if path.is_file() {
            if let Some(filter_fn) = filter_fn {
                if filter_fn(&path) {
                    local_paths.push(path);
                }
            } else {
                local_paths.push(path);
            }
        } else if path.is_dir() {
            local_paths.append(walk_recursive(&path.to_path_buf(), filter_fn)?.as_mut());
        }
    }
    Ok(local_paths)
}

pub fn file_sha256(file: &mut File) -> Result<String, std::io::Error> {
    let mut hasher = Sha256::new();
    let mut buffer = [0; 4096];

    loop {
        let bytes_read = file.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }
    Ok(hex_string(&hasher.finalize()))
}

pub fn sha256_hex(bytes: impl AsRef<[u8]>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes.as_ref());
    hex_string(&hasher.finalize())
}

fn hex_string(digest: &[u8]) -> String {
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

/// Split a file name into lower-cased tokens, treating dots, underscores and
/// spaces as separators. The extension is not stripped by this function.
pub fn tokenize_filename(file_name: &str) -> Vec<String> {
    let is_spaced = file_name.contains(' ');
    let raw_tokens: Box<dyn Iterator<Item = &str> + '_> = match is_spaced {
        true => Box::new(file_name.split(' ')),
        false => Box::new(file_name.split(['.', '_'])),
    };
    raw_tokens
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

pub fn now_secs() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_of_known_input() {
        assert_eq!(
            sha256_hex(b"hello"),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn tokenizes_dotted_and_spaced_names() {
        assert_eq!(
            tokenize_filename("Show.S01E02.1080p.mkv"),
            vec!["show", "s01e02", "1080p", "mkv"]
        );
        assert_eq!(
            tokenize_filename("Show Name S01E02"),
            vec!["show", "name", "s01e02"]
        );
    }
}
