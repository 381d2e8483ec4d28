//! Markdown knowledge base and the `search_knowledge_base` tool exposed to the
//! support agent.
//!
//! Documents are split into sections at `##`/`###` headings. Once
//! [`KnowledgeBase::build_embedding_index`] has embedded every section, queries
//! are ranked by cosine similarity against that index. Without an index, or
//! when embedding the query fails, ranking falls back to lexical overlap
//! between query and section terms.

use std::{
    collections::BTreeSet,
    fmt, fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::{
    functions::{json_schema_for, FunctionDefinition, FunctionParameter, KernelFunction},
    types::EmbeddingRequest,
    LLMError, LLMProvider,
};

pub const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-3-small";
pub const DEFAULT_MAX_RESULTS: usize = 3;
pub const DEFAULT_MIN_SCORE: f64 = 0.3;
pub const SEARCH_TOOL_NAME: &str = "search_knowledge_base";

#[derive(Debug, Clone, PartialEq)]
pub struct Section {
    pub document: String,
    pub title: String,
    pub content: String,
    terms: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Passage {
    pub source_section: String,
    pub document: String,
    pub text: String,
    pub score: f64,
}

/// Section vectors, one per section in order, plus the provider that embeds
/// queries into the same space.
#[derive(Clone)]
struct EmbeddingIndex {
    provider: Arc<dyn LLMProvider>,
    model: String,
    vectors: Vec<Vec<f32>>,
}

impl fmt::Debug for EmbeddingIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmbeddingIndex")
            .field("provider", &self.provider.name())
            .field("model", &self.model)
            .field("vectors", &self.vectors.len())
            .finish()
    }
}

impl EmbeddingIndex {
    async fn scores(&self, query: &str) -> Result<Vec<f64>, LLMError> {
        let request = EmbeddingRequest::new(self.model.clone(), vec![query.to_string()]);
        let query_vector = self
            .provider
            .create_embeddings(request)
            .await?
            .into_vectors()
            .into_iter()
            .next()
            .ok_or(LLMError::InvalidResponse("no embedding returned for query"))?;

        Ok(self
            .vectors
            .iter()
            .map(|vector| cosine_similarity(&query_vector, vector))
            .collect())
    }
}

#[derive(Debug, Clone, Default)]
pub struct KnowledgeBase {
    sections: Vec<Section>,
    index: Option<EmbeddingIndex>,
}

impl KnowledgeBase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads every `*.md` file in `dir`, in file-name order.
    pub fn load_dir(dir: impl AsRef<Path>) -> std::io::Result<Self> {
        let dir = dir.as_ref();
        let mut paths: Vec<PathBuf> = fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .filter(|path| path.extension().and_then(|ext| ext.to_str()) == Some("md"))
            .collect();
        paths.sort();

        let mut base = Self::new();
        for path in &paths {
            let text = match fs::read_to_string(path) {
                Ok(text) => text,
                Err(error) => {
                    tracing::warn!(path = %path.display(), %error, "skipping unreadable knowledge file");
                    continue;
                }
            };
            let document = path
                .file_name()
                .and_then(|name| name.to_str())
                .unwrap_or_default()
                .to_string();
            base.add_markdown(document, &text);
        }

        if base.sections.is_empty() {
            tracing::warn!(dir = %dir.display(), "knowledge base has no sections");
        } else {
            tracing::info!(
                files = paths.len(),
                sections = base.sections.len(),
                "knowledge base loaded"
            );
        }
        Ok(base)
    }

    /// Adds the sections of one markdown document. Drops any embedding index,
    /// which no longer covers every section.
    pub fn add_markdown(&mut self, document: impl Into<String>, markdown: &str) {
        self.index = None;
        let document = document.into();
        let mut title: Option<String> = None;
        let mut body: Vec<&str> = Vec::new();

        for line in markdown.lines() {
            if line.starts_with("## ") || line.starts_with("### ") {
                if let Some(previous) = title.take() {
                    self.push_section(&document, previous, &body);
                }
                title = Some(line.trim_start_matches('#').trim().to_string());
                body.clear();
            } else {
                body.push(line);
            }
        }

        if let Some(previous) = title {
            self.push_section(&document, previous, &body);
        }
    }

    fn push_section(&mut self, document: &str, title: String, body: &[&str]) {
        let content = body.join("\n").trim().to_string();
        if content.is_empty() {
            return;
        }
        let terms = terms(&format!("{title} {content}"));
        self.sections.push(Section {
            document: document.to_string(),
            title,
            content,
            terms,
        });
    }

    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    pub fn has_embedding_index(&self) -> bool {
        self.index.is_some()
    }

    /// Embeds every section once (`title: content`) and switches search to
    /// cosine ranking. On error the base keeps searching lexically.
    pub async fn build_embedding_index(
        &mut self,
        provider: Arc<dyn LLMProvider>,
        model: impl Into<String>,
    ) -> Result<(), LLMError> {
        let model = model.into();
        let texts: Vec<String> = self
            .sections
            .iter()
            .map(|section| format!("{}: {}", section.title, section.content))
            .collect();
        if texts.is_empty() {
            return Ok(());
        }

        let vectors = provider
            .create_embeddings(EmbeddingRequest::new(model.clone(), texts))
            .await?
            .into_vectors();
        if vectors.len() != self.sections.len() {
            return Err(LLMError::InvalidResponse(
                "embedding count does not match section count",
            ));
        }

        tracing::info!(sections = vectors.len(), %model, "knowledge base embedded");
        self.index = Some(EmbeddingIndex {
            provider,
            model,
            vectors,
        });
        Ok(())
    }

    pub async fn search(&self, query: &str) -> Vec<Passage> {
        self.search_with(query, DEFAULT_MAX_RESULTS, DEFAULT_MIN_SCORE).await
    }

    pub async fn search_with(&self, query: &str, max_results: usize, min_score: f64) -> Vec<Passage> {
        if let Some(index) = &self.index {
            match index.scores(query).await {
                Ok(scores) => return self.select(scores, max_results, min_score),
                Err(error) => {
                    tracing::warn!(%error, "query embedding failed, using lexical search");
                }
            }
        }
        self.lexical_search_with(query, max_results, min_score)
    }

    /// Ranks sections by the share of query terms they contain.
    pub fn lexical_search_with(&self, query: &str, max_results: usize, min_score: f64) -> Vec<Passage> {
        let query_terms = terms(query);
        if query_terms.is_empty() {
            return Vec::new();
        }

        let scores = self
            .sections
            .iter()
            .map(|section| {
                let hits = query_terms.intersection(&section.terms).count();
                hits as f64 / query_terms.len() as f64
            })
            .collect();
        self.select(scores, max_results, min_score)
    }

    fn select(&self, scores: Vec<f64>, max_results: usize, min_score: f64) -> Vec<Passage> {
        let mut scored: Vec<(usize, f64)> = scores
            .into_iter()
            .enumerate()
            .filter(|(_, score)| *score >= min_score && *score > 0.0)
            .collect();

        // Stable sort keeps document order among equal scores.
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        scored.truncate(max_results);

        scored
            .into_iter()
            .map(|(index, score)| {
                let section = &self.sections[index];
                Passage {
                    source_section: section.title.clone(),
                    document: section.document.clone(),
                    text: section.content.clone(),
                    score,
                }
            })
            .collect()
    }
}

/// Cosine similarity; 0.0 for mismatched, empty or zero-length vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let (mut dot, mut norm_a, mut norm_b) = (0.0_f64, 0.0_f64, 0.0_f64);
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (f64::from(*x), f64::from(*y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denominator = norm_a.sqrt() * norm_b.sqrt();
    if denominator < f64::EPSILON {
        0.0
    } else {
        dot / denominator
    }
}

/// Lower-cased word terms. Runs of non-ASCII letters (e.g. Japanese) carry no
/// spaces, so they are indexed as character bigrams instead.
fn terms(text: &str) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    for word in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|word| !word.is_empty())
    {
        let word = word.to_lowercase();
        if word.is_ascii() {
            out.insert(word);
            continue;
        }
        let chars: Vec<char> = word.chars().collect();
        if chars.len() == 1 {
            out.insert(word);
        } else {
            for pair in chars.windows(2) {
                out.insert(pair.iter().collect());
            }
        }
    }
    out
}

/// Kernel function wrapping a [`KnowledgeBase`] for tool calling.
#[derive(Debug, Clone)]
pub struct KnowledgeSearchTool {
    base: KnowledgeBase,
}

impl KnowledgeSearchTool {
    pub fn new(base: KnowledgeBase) -> Self {
        Self { base }
    }

    pub async fn render(&self, query: &str) -> String {
        if self.base.is_empty() {
            return "The knowledge base has no content.".to_string();
        }

        let passages = self.base.search(query).await;
        if passages.is_empty() {
            tracing::info!(query, "no knowledge base match");
            return format!("No information related to \"{query}\" was found.");
        }

        let mut out = String::from("## Search results\n");
        for (rank, passage) in passages.iter().enumerate() {
            out.push_str(&format!(
                "\n### {}. {} (relevance: {:.2})\n{}\n",
                rank + 1,
                passage.source_section,
                passage.score,
                passage.text
            ));
        }
        out
    }
}

#[async_trait]
impl KernelFunction for KnowledgeSearchTool {
    fn definition(&self) -> FunctionDefinition {
        FunctionDefinition::new(SEARCH_TOOL_NAME)
            .with_description(
                "Search the support knowledge base (FAQ and policy documents) for passages \
relevant to the customer's question.",
            )
            .with_parameter(
                FunctionParameter::new("query", json_schema_for::<String>())
                    .with_description("Keywords describing the information to find."),
            )
    }

    async fn invoke(&self, arguments: &Value) -> Result<Value, LLMError> {
        let query = arguments
            .get("query")
            .and_then(Value::as_str)
            .ok_or_else(|| LLMError::InvalidFunctionArguments("missing string field 'query'".into()))?;
        Ok(Value::String(self.render(query).await))
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use serde_json::json;

    use super::*;
    use crate::providers::scripted::ScriptedProvider;

    const FAQ: &str = "# FAQ\n\n## Return policy\nUnopened items can be returned within 30 days for a refund.\n\n## Shipping\nStandard shipping takes 3-5 business days.\n\n### Empty heading\n";

    fn base() -> KnowledgeBase {
        let mut base = KnowledgeBase::new();
        base.add_markdown("faq.md", FAQ);
        base
    }

    #[test]
    fn splits_sections_and_drops_empty_ones() {
        let base = base();
        let titles: Vec<_> = base.sections().iter().map(|s| s.title.as_str()).collect();
        assert_eq!(titles, vec!["Return policy", "Shipping"]);
    }

    #[tokio::test]
    async fn ranks_matching_section_first() {
        let hits = base().search("return refund").await;
        assert_eq!(hits[0].source_section, "Return policy");
        assert_eq!(hits[0].document, "faq.md");
        assert!((hits[0].score - 1.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn unrelated_query_finds_nothing() {
        assert!(base().search("password reset").await.is_empty());
    }

    #[test]
    fn japanese_text_matches_on_bigrams() {
        let mut base = KnowledgeBase::new();
        base.add_markdown("ja.md", "## 返品ポリシー\n商品到着後30日以内であれば返品できます。\n");
        let hits = base.lexical_search_with("返品", DEFAULT_MAX_RESULTS, DEFAULT_MIN_SCORE);
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn loads_markdown_files_from_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("b.md"), FAQ).expect("write");
        fs::write(dir.path().join("notes.txt"), "## Ignored\ntext").expect("write");
        let base = KnowledgeBase::load_dir(dir.path()).expect("load");
        assert_eq!(base.sections().len(), 2);
    }

    #[tokio::test]
    async fn tool_formats_results_and_validates_arguments() {
        let tool = KnowledgeSearchTool::new(base());
        let output = tool.invoke(&json!({ "query": "shipping days" })).await.expect("search");
        let text = output.as_str().unwrap_or_default();
        assert!(text.starts_with("## Search results"));
        assert!(text.contains("### 1. Shipping"));

        let error = tool.invoke(&json!({})).await.unwrap_err();
        assert!(matches!(error, LLMError::InvalidFunctionArguments(_)));
    }

    fn embedder() -> Arc<ScriptedProvider> {
        Arc::new(ScriptedProvider::new().with_embedding_terms(["return", "refund", "shipping", "days", "business"]))
    }

    #[tokio::test]
    async fn embedding_index_ranks_by_cosine_similarity() {
        let provider = embedder();
        let mut base = base();
        base.build_embedding_index(provider.clone(), "embed").await.expect("index");
        assert!(base.has_embedding_index());

        // One query term in four appears in the section, below the lexical cut-off.
        let query = "where is my refund";
        assert!(base.lexical_search_with(query, DEFAULT_MAX_RESULTS, DEFAULT_MIN_SCORE).is_empty());

        let hits = base.search(query).await;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].source_section, "Return policy");
        // section [2, 1, 0, 1, 0] against query [0, 1, 0, 0, 0]
        assert!((hits[0].score - 1.0 / 6f64.sqrt()).abs() < 1e-9);
    }

    #[tokio::test]
    async fn sections_are_embedded_once_and_queries_per_search() {
        let provider = embedder();
        let mut base = base();
        base.build_embedding_index(provider.clone(), "embed").await.expect("index");
        base.search("refund").await;
        base.search("shipping days").await;

        let requests = provider.embedding_requests();
        assert_eq!(requests.len(), 3);
        assert_eq!(requests[0].input, vec![
            "Return policy: Unopened items can be returned within 30 days for a refund.".to_string(),
            "Shipping: Standard shipping takes 3-5 business days.".to_string(),
        ]);
        assert_eq!(requests[2].input, vec!["shipping days".to_string()]);
        assert_eq!(requests[2].model, "embed");
    }

    #[tokio::test]
    async fn provider_without_embeddings_keeps_lexical_search() {
        let mut base = base();
        let error = base
            .build_embedding_index(Arc::new(ScriptedProvider::new()), "embed")
            .await
            .unwrap_err();
        assert!(matches!(error, LLMError::Unsupported(_)));
        assert!(!base.has_embedding_index());
        assert_eq!(base.search("return refund").await[0].source_section, "Return policy");
    }

    #[tokio::test]
    async fn adding_documents_drops_the_index() {
        let mut base = base();
        base.build_embedding_index(embedder(), "embed").await.expect("index");
        base.add_markdown("more.md", "## Gift cards\nGift cards never expire.\n");
        assert!(!base.has_embedding_index());
    }

    #[test]
    fn cosine_similarity_handles_degenerate_vectors() {
        assert!((cosine_similarity(&[1.0, 2.0], &[2.0, 4.0]) - 1.0).abs() < 1e-9);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 1.0]), 0.0);
    }
}
