//! Authorized SSH public keys stored in an OpenSSH `authorized_keys` file

use crate::{Context, Error, Result};
use base64::Engine;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

const KEY_TYPES: &[&str] = &[
    "ssh-rsa",
    "ssh-dss",
    "ssh-ed25519",
    "ecdsa-sha2-nistp256",
    "ecdsa-sha2-nistp384",
    "ecdsa-sha2-nistp521",
    "sk-ecdsa-sha2-nistp256@openssh.com",
    "sk-ssh-ed25519@openssh.com",
];

/// One public key line
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Key {
    pub key_type: String,
    /// Base64 encoded key blob
    pub value: String,
    pub comment: String,
    pub options: Vec<String>,
    /// Legacy colon separated MD5 fingerprint of the key blob
    pub fingerprint: String,
}

impl Key {
    /// Parse an `authorized_keys` line: `[options] type base64 [comment]`
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Err(Error::validation("empty key line"));
        }

        let (options, rest) = if is_key_type(first_token(line)) {
            (Vec::new(), line)
        } else {
            let (options, rest) = split_options(line);
            if !is_key_type(first_token(rest)) {
                return Err(Error::validation(format!(
                    "unrecognized key type in line: {}",
                    truncate(line)
                )));
            }
            (options, rest)
        };

        let mut parts = rest.splitn(3, char::is_whitespace);
        let key_type = parts.next().unwrap_or_default().to_string();
        let value = parts
            .next()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| Error::validation(format!("missing key material for {}", key_type)))?
            .to_string();
        let comment = parts.next().map(str::trim).unwrap_or_default().to_string();
        let fingerprint = fingerprint(&value)?;

        Ok(Self {
            key_type,
            value,
            comment,
            options,
            fingerprint,
        })
    }

    /// `type base64`, the form cloud-init and OpenStack metadata expect
    pub fn material(&self) -> String {
        format!("{} {}", self.key_type, self.value)
    }

    /// `type base64 [comment]` without any authorized_keys options
    pub fn public_key(&self) -> String {
        if self.comment.is_empty() {
            self.material()
        } else {
            format!("{} {}", self.material(), self.comment)
        }
    }

    /// Full line as written to the key file
    pub fn to_line(&self) -> String {
        let mut line = String::new();
        if !self.options.is_empty() {
            line.push_str(&self.options.join(","));
            line.push(' ');
        }
        line.push_str(&self.material());
        if !self.comment.is_empty() {
            line.push(' ');
            line.push_str(&self.comment);
        }
        line
    }
}

fn first_token(s: &str) -> &str {
    s.split_whitespace().next().unwrap_or_default()
}

fn is_key_type(token: &str) -> bool {
    KEY_TYPES.contains(&token)
}

fn truncate(line: &str) -> String {
    line.chars().take(40).collect()
}

/// Split the leading options field, honouring double quotes
fn split_options(line: &str) -> (Vec<String>, &str) {
    let mut options = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut end = line.len();

    for (i, c) in line.char_indices() {
        match c {
            '"' => {
                quoted = !quoted;
                current.push(c);
            }
            ',' if !quoted => options.push(std::mem::take(&mut current)),
            c if c.is_whitespace() && !quoted => {
                end = i;
                break;
            }
            _ => current.push(c),
        }
    }
    if !current.is_empty() {
        options.push(current);
    }
    (options, line[end..].trim_start())
}

/// Legacy MD5 fingerprint: `aa:bb:..` over the decoded key blob
pub fn fingerprint(value: &str) -> Result<String> {
    let blob = base64::engine::general_purpose::STANDARD
        .decode(value.trim())
        .map_err(|e| Error::validation(format!("invalid key material: {}", e)))?;
    let digest = md5::compute(blob);
    Ok(digest
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":"))
}

/// File backed key store. Relies on the filesystem for consistency.
#[derive(Debug, Clone)]
pub struct KeyStore {
    path: PathBuf,
}

impl KeyStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<String> {
        match fs::read_to_string(&self.path) {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e).with_context(|| format!("cannot read key file {}", self.path.display())),
        }
    }

    /// All parseable keys; unknown lines are logged and skipped
    pub fn list(&self) -> Result<Vec<Key>> {
        let content = self.read()?;
        let mut keys = Vec::new();
        for (number, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match Key::parse(line) {
                Ok(key) => keys.push(key),
                Err(e) => log::warn!(
                    "skipping line {} of {}: {}",
                    number + 1,
                    self.path.display(),
                    e
                ),
            }
        }
        Ok(keys)
    }

    pub fn get(&self, fingerprint: &str) -> Result<Key> {
        self.list()?
            .into_iter()
            .find(|k| k.fingerprint == fingerprint)
            .ok_or_else(|| Error::NotFound(format!("key {}", fingerprint)))
    }

    /// Append a key line, rejecting duplicates by fingerprint
    pub fn add(&self, line: &str) -> Result<Key> {
        let key = Key::parse(line)?;
        if self.list()?.iter().any(|k| k.fingerprint == key.fingerprint) {
            return Err(Error::AlreadyExists(format!("key {}", key.fingerprint)));
        }

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("cannot create {}", parent.display()))?;
            }
        }

        let existing = self.read()?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("cannot open key file {}", self.path.display()))?;
        let mut out = String::new();
        if !existing.is_empty() && !existing.ends_with('\n') {
            out.push('\n');
        }
        out.push_str(&key.to_line());
        out.push('\n');
        file.write_all(out.as_bytes())?;
        Ok(key)
    }

    /// Rewrite the file without the key; other lines are kept verbatim
    pub fn delete(&self, fingerprint: &str) -> Result<()> {
        let content = self.read()?;
        let mut found = false;
        let mut out = String::with_capacity(content.len());
        for line in content.lines() {
            let matches = Key::parse(line)
                .map(|k| k.fingerprint == fingerprint)
                .unwrap_or(false);
            if matches {
                found = true;
                continue;
            }
            out.push_str(line);
            out.push('\n');
        }
        if !found {
            return Err(Error::NotFound(format!("key {}", fingerprint)));
        }
        fs::write(&self.path, out)
            .with_context(|| format!("cannot write key file {}", self.path.display()))?;
        Ok(())
    }
}
