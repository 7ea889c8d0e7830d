use std::io::{self, Write};
use std::sync::{Arc, RwLock};

use tracing_subscriber::fmt::MakeWriter;

const MASK: &str = "***";

/// Sink notified of every secret value the crate extracts, so that nothing
/// downstream prints it in clear text.
pub trait SecretMasker: Send + Sync {
    fn register(&self, secret: &str);
}

/// In-process list of secrets, shared with the log writer.
#[derive(Clone, Default)]
pub struct SecretRegistry {
    secrets: Arc<RwLock<Vec<String>>>,
}

impl SecretRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, value: &str) -> bool {
        self.secrets
            .read()
            .map(|secrets| secrets.iter().any(|s| s == value))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.secrets.read().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replaces every registered secret in `text` with `***`.
    pub fn redact(&self, text: &str) -> String {
        let Ok(secrets) = self.secrets.read() else {
            return text.to_string();
        };
        let mut out = text.to_string();
        for secret in secrets.iter() {
            if out.contains(secret.as_str()) {
                out = out.replace(secret.as_str(), MASK);
            }
        }
        out
    }
}

impl SecretMasker for SecretRegistry {
    fn register(&self, secret: &str) {
        if secret.is_empty() {
            return;
        }
        if let Ok(mut secrets) = self.secrets.write() {
            if secrets.iter().any(|s| s == secret) {
                return;
            }
            secrets.push(secret.to_string());
            // Longest first so a secret containing another is masked whole.
            secrets.sort_by(|a, b| b.len().cmp(&a.len()));
        }
    }
}

/// Emits the runner's `::add-mask::` workflow command, then forwards to an
/// in-process registry.
#[derive(Clone, Default)]
pub struct ActionsMasker {
    registry: SecretRegistry,
}

impl ActionsMasker {
    pub fn new(registry: SecretRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &SecretRegistry {
        &self.registry
    }
}

fn add_mask_command(secret: &str) -> String {
    // Workflow commands are line based; escape the characters the runner decodes.
    let escaped = secret
        .replace('%', "%25")
        .replace('\r', "%0D")
        .replace('\n', "%0A");
    format!("::add-mask::{}", escaped)
}

impl SecretMasker for ActionsMasker {
    fn register(&self, secret: &str) {
        if secret.is_empty() {
            return;
        }
        println!("{}", add_mask_command(secret));
        self.registry.register(secret);
    }
}

/// `MakeWriter` for tracing-subscriber that redacts registered secrets
/// before anything reaches stderr.
#[derive(Clone)]
pub struct MaskingMakeWriter {
    registry: SecretRegistry,
}

impl MaskingMakeWriter {
    pub fn new(registry: SecretRegistry) -> Self {
        Self { registry }
    }
}

pub struct MaskingWriter<W: Write> {
    registry: SecretRegistry,
    inner: W,
}

impl<W: Write> MaskingWriter<W> {
    pub fn new(registry: SecretRegistry, inner: W) -> Self {
        Self { registry, inner }
    }
}

impl<W: Write> Write for MaskingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let text = String::from_utf8_lossy(buf);
        let redacted = self.registry.redact(&text);
        self.inner.write_all(redacted.as_bytes())?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl<'a> MakeWriter<'a> for MaskingMakeWriter {
    type Writer = MaskingWriter<io::Stderr>;

    fn make_writer(&'a self) -> Self::Writer {
        MaskingWriter::new(self.registry.clone(), io::stderr())
    }
}
