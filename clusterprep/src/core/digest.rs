//! Stage content fingerprints.
//!
//! Each instruction is hashed on its own, then the per-instruction hashes are
//! folded into one running hash in list order. Reordering instructions changes
//! the result.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use super::Instruction;

/// Hex-encoded SHA-256 fingerprint of a stage's content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StageDigest(String);

impl StageDigest {
    /// Computes the digest of an ordered instruction list.
    #[must_use]
    pub fn of_instructions(instructions: &[Instruction]) -> Self {
        let mut folded = Sha256::new();
        for instruction in instructions {
            folded.update(hash_instruction(instruction));
        }
        Self(hex::encode(folded.finalize()))
    }

    /// Computes the digest of an ordered list of plain commands.
    #[must_use]
    pub fn of_commands<S: AsRef<str>>(commands: &[S]) -> Self {
        let instructions: Vec<Instruction> = commands
            .iter()
            .map(|c| Instruction::new(c.as_ref()))
            .collect();
        Self::of_instructions(&instructions)
    }

    /// Computes a digest over labelled parts, in order.
    #[must_use]
    pub fn from_parts<'a, I>(parts: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut folded = Sha256::new();
        for (label, value) in parts {
            let mut part = Sha256::new();
            update_field(&mut part, label.as_bytes());
            update_field(&mut part, value.as_bytes());
            folded.update(part.finalize());
        }
        Self(hex::encode(folded.finalize()))
    }

    /// Wraps an already computed digest string.
    #[must_use]
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    /// Returns the hex string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StageDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn hash_instruction(instruction: &Instruction) -> sha2::digest::Output<Sha256> {
    let mut hasher = Sha256::new();
    update_field(&mut hasher, instruction.command.as_bytes());
    match instruction.workdir {
        Some(ref dir) => {
            hasher.update([1u8]);
            update_field(&mut hasher, dir.as_bytes());
        }
        None => hasher.update([0u8]),
    }
    hasher.update((instruction.env.len() as u64).to_le_bytes());
    for (key, value) in &instruction.env {
        update_field(&mut hasher, key.as_bytes());
        update_field(&mut hasher, value.as_bytes());
    }
    hasher.update((instruction.unset_env.len() as u64).to_le_bytes());
    for name in &instruction.unset_env {
        update_field(&mut hasher, name.as_bytes());
    }
    hasher.update([u8::from(instruction.tolerate_failure)]);
    hasher.finalize()
}

// Length prefix keeps ("ab", "c") and ("a", "bc") apart.
fn update_field(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}
