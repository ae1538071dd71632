use std::collections::HashSet;
use std::fs;
use std::path::Path;

use walkdir::WalkDir;

const INDEXED_EXTENSIONS: &[&str] = &["md", "markdown", "txt", "html", "htm"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentChunk {
    pub source: String,
    pub text: String,
}

/// In-memory lexical index over overlapping character windows of local documents.
#[derive(Debug, Clone, Default)]
pub struct DocumentIndex {
    chunks: Vec<DocumentChunk>,
}

impl DocumentIndex {
    pub fn load_dir(dir: &Path, chunk_size: usize, chunk_overlap: usize) -> Result<Self, String> {
        if !dir.is_dir() {
            return Err(format!("document directory not found: {}", dir.display()));
        }

        let mut documents = Vec::new();
        for entry in WalkDir::new(dir)
            .follow_links(true)
            .sort_by_file_name()
            .into_iter()
            .filter_map(Result::ok)
        {
            let path = entry.path();
            let indexed = path
                .extension()
                .and_then(|extension| extension.to_str())
                .is_some_and(|extension| {
                    INDEXED_EXTENSIONS.contains(&extension.to_ascii_lowercase().as_str())
                });
            if !entry.file_type().is_file() || !indexed {
                continue;
            }
            match fs::read_to_string(path) {
                Ok(content) => documents.push((path.display().to_string(), content)),
                Err(error) => tracing::warn!(
                    path = %path.display(),
                    error = %error,
                    "skipping unreadable document"
                ),
            }
        }

        Ok(Self::from_documents(documents, chunk_size, chunk_overlap))
    }

    pub fn from_documents(
        documents: Vec<(String, String)>,
        chunk_size: usize,
        chunk_overlap: usize,
    ) -> Self {
        let chunks = documents
            .into_iter()
            .flat_map(|(source, content)| {
                split_text(&content, chunk_size, chunk_overlap)
                    .into_iter()
                    .map(move |text| DocumentChunk {
                        source: source.clone(),
                        text,
                    })
            })
            .collect();
        Self { chunks }
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Up to `k` chunks sharing terms with `query`, best first. Ties keep index order.
    pub fn search(&self, query: &str, k: usize) -> Vec<&DocumentChunk> {
        let terms: HashSet<String> = tokenize(query).collect();
        if terms.is_empty() {
            return vec![];
        }

        let mut scored: Vec<(usize, &DocumentChunk)> = self
            .chunks
            .iter()
            .map(|chunk| {
                let score = tokenize(&chunk.text)
                    .filter(|token| terms.contains(token))
                    .count();
                (score, chunk)
            })
            .filter(|(score, _)| *score > 0)
            .collect();
        scored.sort_by(|left, right| right.0.cmp(&left.0));
        scored.into_iter().take(k).map(|(_, chunk)| chunk).collect()
    }
}

/// Character windows of `chunk_size` that overlap by `chunk_overlap`.
pub fn split_text(text: &str, chunk_size: usize, chunk_overlap: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    if chars.is_empty() || chunk_size == 0 {
        return vec![];
    }
    let step = chunk_size.saturating_sub(chunk_overlap).max(1);

    let mut chunks = Vec::new();
    let mut start = 0;
    loop {
        let end = (start + chunk_size).min(chars.len());
        let chunk: String = chars[start..end].iter().collect();
        if !chunk.trim().is_empty() {
            chunks.push(chunk.trim().to_string());
        }
        if end == chars.len() {
            break;
        }
        start += step;
    }
    chunks
}

fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|ch: char| !ch.is_alphanumeric())
        .filter(|token| token.chars().count() > 2)
        .map(str::to_lowercase)
}
