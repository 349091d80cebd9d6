use tracing::warn;

/// Splits on a separator and greedily merges the pieces into chunks of at
/// most `chunk_size` characters, carrying up to `chunk_overlap` characters
/// of trailing pieces into the next chunk.
#[derive(Debug, Clone)]
pub struct CharacterTextSplitter {
    separator: String,
    chunk_size: usize,
    chunk_overlap: usize,
}

impl CharacterTextSplitter {
    pub fn new(separator: impl Into<String>, chunk_size: usize, chunk_overlap: usize) -> anyhow::Result<Self> {
        if chunk_size == 0 {
            anyhow::bail!("chunk_size must be positive");
        }
        if chunk_overlap >= chunk_size {
            anyhow::bail!("chunk_overlap ({}) must be smaller than chunk_size ({})", chunk_overlap, chunk_size);
        }
        Ok(Self { separator: separator.into(), chunk_size, chunk_overlap })
    }

    fn len(s: &str) -> usize { s.chars().count() }

    pub fn split_text(&self, text: &str) -> Vec<String> {
        let splits: Vec<&str> = if self.separator.is_empty() {
            vec![text]
        } else {
            text.split(self.separator.as_str()).filter(|s| !s.is_empty()).collect()
        };
        self.merge(&splits)
    }

    fn join(&self, pieces: &[&str]) -> Option<String> {
        let joined = pieces.join(&self.separator);
        let trimmed = joined.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    }

    fn merge(&self, splits: &[&str]) -> Vec<String> {
        let sep_len = Self::len(&self.separator);
        let mut docs = Vec::new();
        let mut current: std::collections::VecDeque<&str> = std::collections::VecDeque::new();
        let mut total = 0usize;

        for piece in splits {
            let len = Self::len(piece);
            let joiner = if current.is_empty() { 0 } else { sep_len };
            if total + len + joiner > self.chunk_size {
                if total > self.chunk_size {
                    warn!(size = total, limit = self.chunk_size, "created a chunk larger than the limit");
                }
                if !current.is_empty() {
                    let pieces: Vec<&str> = current.iter().copied().collect();
                    docs.extend(self.join(&pieces));
                    while total > self.chunk_overlap
                        || (total > 0 && total + len + if current.is_empty() { 0 } else { sep_len } > self.chunk_size)
                    {
                        let Some(first) = current.pop_front() else { break };
                        total -= Self::len(first) + if current.is_empty() { 0 } else { sep_len };
                    }
                }
            }
            let joiner = if current.is_empty() { 0 } else { sep_len };
            current.push_back(piece);
            total += len + joiner;
        }
        let pieces: Vec<&str> = current.iter().copied().collect();
        docs.extend(self.join(&pieces));
        docs
    }
}
