//! §4.3 Mutator: produces a mutated buffer from a parent input.

use std::io::Write;
use std::path::Path;
use std::process::{Command, Stdio};

use crate::error::{Error, Result};
use crate::rng::Lcg;

/// A one-token-per-line dictionary, spliced into mutations by token
/// substitution.
#[derive(Debug, Clone, Default)]
pub struct Dictionary {
    tokens: Vec<Vec<u8>>,
}

impl Dictionary {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let tokens = text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .map(|l| l.as_bytes().to_vec())
            .collect();
        Ok(Dictionary { tokens })
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }
}

/// An external mutator command line: reads the parent on stdin, writes the
/// mutated child on stdout (§4.3).
#[derive(Debug, Clone)]
pub struct ExternalMutator {
    cmdline: String,
}

impl ExternalMutator {
    pub fn new(cmdline: String) -> Self {
        ExternalMutator { cmdline }
    }

    fn run(&self, parent: &[u8]) -> Result<Vec<u8>> {
        let mut parts = self.cmdline.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| Error::Launch("external mutator command line is empty".into()))?;
        let mut child = Command::new(program)
            .args(parts)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| Error::Launch(format!("spawning external mutator: {e}")))?;

        if let Some(mut stdin) = child.stdin.take() {
            let _ = stdin.write_all(parent);
        }
        let output = child
            .wait_with_output()
            .map_err(|e| Error::Launch(format!("waiting for external mutator: {e}")))?;
        Ok(output.stdout)
    }
}

/// Produces mutated buffers given a flip rate, optional dictionary and
/// optional external command (§4.3).
pub struct Mutator {
    max_file_sz: usize,
}

impl Mutator {
    pub fn new(max_file_sz: usize) -> Self {
        Mutator { max_file_sz }
    }

    /// Produce a mutated buffer whose expected fraction of differing bytes
    /// is `flip_rate`. `flip_rate == 0.0` with no dictionary is the
    /// identity (§8 round-trip law).
    pub fn mutate(
        &self,
        parent: &[u8],
        rng: &mut Lcg,
        flip_rate: f64,
        dict: Option<&Dictionary>,
        external: Option<&ExternalMutator>,
    ) -> Result<Vec<u8>> {
        if let Some(external) = external {
            let mut out = external.run(parent)?;
            out.truncate(self.max_file_sz);
            return Ok(out);
        }

        let mut out = parent.to_vec();
        if out.is_empty() {
            // honggfuzz grows empty seeds up to a handful of random bytes
            // rather than mutating nothing.
            let grow = rng.below(16) + 1;
            out.resize(grow.min(self.max_file_sz), 0);
            rng.fill_bytes(&mut out);
            return Ok(out);
        }

        if flip_rate > 0.0 {
            for byte in out.iter_mut() {
                if rng.chance(flip_rate) {
                    *byte = rng.next_byte();
                }
            }
        }

        if let Some(dict) = dict {
            if !dict.is_empty() && rng.chance(0.2) {
                let token = &dict.tokens[rng.below(dict.len())];
                let at = rng.below(out.len());
                splice_token(&mut out, at, token, self.max_file_sz);
            }
        }

        out.truncate(self.max_file_sz);
        Ok(out)
    }
}

fn splice_token(buf: &mut Vec<u8>, at: usize, token: &[u8], max_file_sz: usize) {
    let end = (at + token.len()).min(buf.len());
    if at >= end {
        return;
    }
    buf.splice(at..end, token[..end - at].iter().copied());
    buf.truncate(max_file_sz);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_flip_rate_without_dictionary_is_identity() {
        let mutator = Mutator::new(1024);
        let mut rng = Lcg::from_seed(1);
        let parent = b"the quick brown fox".to_vec();
        let out = mutator.mutate(&parent, &mut rng, 0.0, None, None).unwrap();
        assert_eq!(out, parent);
    }

    #[test]
    fn empty_seed_produces_bounded_nonempty_output() {
        let mutator = Mutator::new(8);
        let mut rng = Lcg::from_seed(2);
        let out = mutator.mutate(&[], &mut rng, 0.5, None, None).unwrap();
        assert!(!out.is_empty());
        assert!(out.len() <= 8);
    }

    #[test]
    fn output_never_exceeds_max_file_size() {
        let mutator = Mutator::new(4);
        let mut rng = Lcg::from_seed(3);
        let parent = vec![0u8; 100];
        let out = mutator.mutate(&parent, &mut rng, 0.5, None, None).unwrap();
        assert!(out.len() <= 4);
    }

    #[test]
    fn full_flip_rate_changes_most_bytes() {
        let mutator = Mutator::new(1024);
        let mut rng = Lcg::from_seed(4);
        let parent = vec![0u8; 256];
        let out = mutator.mutate(&parent, &mut rng, 1.0, None, None).unwrap();
        let changed = out.iter().zip(parent.iter()).filter(|(a, b)| a != b).count();
        // With flip_rate 1.0 every byte is re-rolled; a handful may roll
        // back to zero by chance, so assert the overwhelming majority moved.
        assert!(changed > 200, "expected most bytes to change, got {changed}");
    }

    #[test]
    fn dictionary_loading_skips_blank_and_comment_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dict.txt");
        std::fs::write(&path, "# comment\nfoo\n\nbar\n").unwrap();
        let dict = Dictionary::load(&path).unwrap();
        assert_eq!(dict.len(), 2);
    }
}
