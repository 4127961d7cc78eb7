//! Inference session
//!
//! Holds at most one model handle per process and runs streaming generation
//! against it. One lock covers load, unload and generate: a generation keeps it
//! until its stream ends, and other callers queue behind it in arrival order.

use crate::inference::model::{ModelHandle, ModelLoader, TokenAction};
use crate::inference::normalize::{PrefixStripper, ResponseNormalizer, DEFAULT_MIN_PREFIX_LEN};
use crate::inference::prompt::PromptPolicy;
use crate::inference::streaming::{GenerationStream, StreamToken, STREAM_CAPACITY};
use crate::inference::InferenceError;
use crate::storage::models::ModelRegistry;
use crate::types::config::LoadConfig;
use crate::types::message::ConversationTurn;
use crate::types::model::normalize_model_id;
use crate::types::sampling::SamplingParameters;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};
use uuid::Uuid;

pub const NO_MODEL_MESSAGE: &str = "Model not loaded. Please select and load a model first.";

#[derive(Default)]
struct SessionState {
    model_id: Option<String>,
    handle: Option<Box<dyn ModelHandle>>,
}

/// Everything the blocking side needs, detached from `&self`
#[derive(Clone)]
struct Backend {
    loader: Arc<dyn ModelLoader>,
    registry: Arc<dyn ModelRegistry>,
    load_config: LoadConfig,
}

impl Backend {
    fn release(&self, state: &mut SessionState) {
        // Drop the handle before touching anything else
        state.handle = None;
        if let Some(id) = state.model_id.take() {
            if let Err(e) = self.registry.set_loaded(&id, false) {
                tracing::warn!("Failed to clear loaded flag for {}: {}", id, e);
            }
            tracing::info!("Model {} unloaded", id);
        }
    }

    fn load(&self, state: &mut SessionState, id: &str) -> Result<(), InferenceError> {
        if state.handle.is_some() && state.model_id.as_deref() == Some(id) {
            tracing::info!("Model {} already loaded", id);
            return Ok(());
        }

        self.release(state);

        let path = self
            .registry
            .get_local_path(id)
            .ok_or_else(|| InferenceError::UnknownModel(id.to_string()))?;
        if !self.registry.is_downloaded(id) {
            return Err(InferenceError::ModelNotFound(path));
        }

        tracing::info!("Loading model {} from {}", id, path.display());
        let handle = self.loader.load(&path, &self.load_config)?;

        state.handle = Some(handle);
        state.model_id = Some(id.to_string());
        if let Err(e) = self.registry.set_loaded(id, true) {
            tracing::warn!("Failed to set loaded flag for {}: {}", id, e);
        }
        Ok(())
    }
}

/// The process's single model session
pub struct InferenceSession {
    backend: Backend,
    policy: PromptPolicy,
    min_prefix_len: usize,
    state: Arc<Mutex<SessionState>>,
}

impl InferenceSession {
    pub fn new(loader: Arc<dyn ModelLoader>, registry: Arc<dyn ModelRegistry>, load_config: LoadConfig) -> Self {
        Self {
            backend: Backend {
                loader,
                registry,
                load_config,
            },
            policy: PromptPolicy::default(),
            min_prefix_len: DEFAULT_MIN_PREFIX_LEN,
            state: Arc::new(Mutex::new(SessionState::default())),
        }
    }

    pub fn with_prompt_policy(mut self, policy: PromptPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Characters of response text buffered before the opening is released
    pub fn with_min_prefix_len(mut self, min_prefix_len: usize) -> Self {
        self.min_prefix_len = min_prefix_len;
        self
    }

    pub fn prompt_policy(&self) -> &PromptPolicy {
        &self.policy
    }

    /// Identifier of the loaded model, if any
    pub async fn loaded_model(&self) -> Option<String> {
        let state = self.state.lock().await;
        state.handle.as_ref().and(state.model_id.clone())
    }

    /// Whether the registry has a local file for this model
    pub fn is_model_available(&self, id: &str) -> bool {
        self.backend.registry.is_downloaded(&normalize_model_id(id))
    }

    /// Load a model, releasing the current one first.
    ///
    /// Returns `true` if the model is loaded afterwards. Loading the model that is
    /// already loaded does nothing. On failure no model is loaded.
    pub async fn load(&self, id: &str) -> bool {
        let id = normalize_model_id(id);
        let mut guard = Arc::clone(&self.state).lock_owned().await;
        let backend = self.backend.clone();

        let result = tokio::task::spawn_blocking(move || backend.load(&mut guard, &id).map_err(|e| (id, e))).await;
        match result {
            Ok(Ok(())) => true,
            Ok(Err((id, e))) => {
                tracing::error!("Failed to load model {}: {}", id, e);
                false
            }
            Err(e) => {
                tracing::error!("Model load task failed: {}", e);
                false
            }
        }
    }

    /// Release the loaded model, if any
    pub async fn unload(&self) {
        let mut state = self.state.lock().await;
        self.backend.release(&mut state);
    }

    /// Stream a response to `user_message` with the loaded model.
    ///
    /// Never fails: problems are reported as a single terminal
    /// [`StreamToken::Error`] unit.
    pub async fn generate(
        &self,
        history: &[ConversationTurn],
        system_prompt: &str,
        user_message: &str,
        params: SamplingParameters,
    ) -> GenerationStream {
        let guard = Arc::clone(&self.state).lock_owned().await;
        let prompt = self.policy.assemble(history, system_prompt, user_message);
        self.start(guard, None, prompt, params)
    }

    /// Like [`generate`](Self::generate), but first makes sure `model_id` is the
    /// loaded model, under the same lock so no other request can swap it in between.
    pub async fn generate_with_model(
        &self,
        model_id: &str,
        history: &[ConversationTurn],
        system_prompt: &str,
        user_message: &str,
        params: SamplingParameters,
    ) -> GenerationStream {
        let guard = Arc::clone(&self.state).lock_owned().await;
        let prompt = self.policy.assemble(history, system_prompt, user_message);
        self.start(guard, Some(normalize_model_id(model_id)), prompt, params)
    }

    fn normalizer(&self) -> ResponseNormalizer {
        let stripper = PrefixStripper::default().with_patterns(self.policy.role_labels());
        ResponseNormalizer::new(stripper, self.policy.stop_sequences(), self.min_prefix_len)
    }

    fn start(
        &self,
        mut guard: OwnedMutexGuard<SessionState>,
        model_id: Option<String>,
        prompt: String,
        params: SamplingParameters,
    ) -> GenerationStream {
        let request_id = Uuid::new_v4();

        if model_id.is_none() && guard.handle.is_none() {
            tracing::warn!("Generation requested with no model loaded");
            return GenerationStream::single(request_id, StreamToken::Error(NO_MODEL_MESSAGE.to_string()));
        }

        let (tx, rx) = mpsc::channel(STREAM_CAPACITY);
        let backend = self.backend.clone();
        let normalizer = self.normalizer();
        let span = tracing::info_span!("generate", request = %request_id);

        tokio::task::spawn_blocking(move || {
            let _span = span.entered();
            if let Some(id) = model_id {
                if let Err(e) = backend.load(&mut guard, &id) {
                    tracing::error!("Failed to load model {}: {}", id, e);
                    let _ = tx.blocking_send(StreamToken::Error(format!("Model {id} could not be loaded: {e}")));
                    return;
                }
            }
            run_generation(&mut guard, &prompt, &params, normalizer, &tx);
        });

        GenerationStream::new(request_id, rx)
    }
}

/// Decode loop body; runs on a blocking thread while the session lock is held
fn run_generation(
    state: &mut SessionState,
    prompt: &str,
    params: &SamplingParameters,
    mut normalizer: ResponseNormalizer,
    tx: &mpsc::Sender<StreamToken>,
) {
    let Some(handle) = state.handle.as_mut() else {
        let _ = tx.blocking_send(StreamToken::Error(NO_MODEL_MESSAGE.to_string()));
        return;
    };

    tracing::debug!(
        "Prompt is {} chars (temp={}, max_tokens={}, top_p={}, top_k={}, repeat_penalty={})",
        prompt.len(),
        params.temperature,
        params.max_tokens,
        params.top_p,
        params.top_k,
        params.repeat_penalty
    );

    let mut receiver_gone = false;
    let mut on_piece = |piece: &str| {
        if tx.is_closed() {
            receiver_gone = true;
            return TokenAction::Stop;
        }
        if let Some(text) = normalizer.push(piece) {
            if tx.blocking_send(StreamToken::Token(text)).is_err() {
                receiver_gone = true;
                return TokenAction::Stop;
            }
        }
        if normalizer.is_stopped() {
            TokenAction::Stop
        } else {
            TokenAction::Continue
        }
    };

    match handle.generate(prompt, params, &mut on_piece) {
        Ok(summary) => {
            if receiver_gone {
                tracing::info!("Stream closed by consumer after {} tokens", summary.output_tokens);
                return;
            }
            if let Some(text) = normalizer.finish() {
                let _ = tx.blocking_send(StreamToken::Token(text));
            }
            tracing::debug!(
                "Generation complete: {} prompt tokens, {} output tokens",
                summary.prompt_tokens,
                summary.output_tokens
            );
        }
        Err(e) => {
            tracing::error!("Generation failed: {}", e);
            let _ = tx.blocking_send(StreamToken::Error(format!("Error during generation: {e}")));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::model::GenerationSummary;
    use crate::storage::models::JsonModelRegistry;
    use crate::types::model::ModelDescriptor;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use tempfile::TempDir;

    /// Streams fixed pieces; optionally fails after them
    struct StubHandle {
        pieces: Vec<String>,
        fail_after: bool,
        prompts: Arc<StdMutex<Vec<String>>>,
        emitted: Arc<AtomicUsize>,
        live: Arc<AtomicUsize>,
    }

    impl Drop for StubHandle {
        fn drop(&mut self) {
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }

    impl ModelHandle for StubHandle {
        fn generate(
            &mut self,
            prompt: &str,
            _params: &SamplingParameters,
            on_piece: &mut dyn FnMut(&str) -> TokenAction,
        ) -> Result<GenerationSummary, InferenceError> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            let mut output_tokens = 0;
            for piece in &self.pieces {
                output_tokens += 1;
                self.emitted.fetch_add(1, Ordering::SeqCst);
                if on_piece(piece) == TokenAction::Stop {
                    break;
                }
            }
            if self.fail_after {
                return Err(InferenceError::Decode("native failure".to_string()));
            }
            Ok(GenerationSummary {
                prompt_tokens: prompt.len(),
                output_tokens,
            })
        }
    }

    struct StubLoader {
        pieces: Vec<String>,
        fail_after: bool,
        loads: AtomicUsize,
        live: Arc<AtomicUsize>,
        max_live: AtomicUsize,
        prompts: Arc<StdMutex<Vec<String>>>,
        emitted: Arc<AtomicUsize>,
    }

    impl StubLoader {
        fn new(pieces: &[&str]) -> Self {
            Self {
                pieces: pieces.iter().map(|p| p.to_string()).collect(),
                fail_after: false,
                loads: AtomicUsize::new(0),
                live: Arc::new(AtomicUsize::new(0)),
                max_live: AtomicUsize::new(0),
                prompts: Arc::new(StdMutex::new(Vec::new())),
                emitted: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    impl ModelLoader for StubLoader {
        fn load(&self, path: &Path, _config: &LoadConfig) -> Result<Box<dyn ModelHandle>, InferenceError> {
            let bytes = std::fs::read(path)?;
            if bytes.starts_with(b"corrupt") {
                return Err(InferenceError::ModelLoad("bad magic".to_string()));
            }
            self.loads.fetch_add(1, Ordering::SeqCst);
            let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_live.fetch_max(live, Ordering::SeqCst);
            Ok(Box::new(StubHandle {
                pieces: self.pieces.clone(),
                fail_after: self.fail_after,
                prompts: Arc::clone(&self.prompts),
                emitted: Arc::clone(&self.emitted),
                live: Arc::clone(&self.live),
            }))
        }
    }

    fn registry_with(dir: &TempDir, models: &[(&str, &[u8])]) -> Arc<JsonModelRegistry> {
        let registry = JsonModelRegistry::open_empty(dir.path()).unwrap();
        for (name, contents) in models {
            std::fs::write(dir.path().join(format!("{name}.gguf")), contents).unwrap();
            registry
                .insert(ModelDescriptor::new(*name, "1KB", "GGUF", "", dir.path()))
                .unwrap();
        }
        Arc::new(registry)
    }

    fn session(loader: Arc<StubLoader>, registry: Arc<JsonModelRegistry>) -> InferenceSession {
        InferenceSession::new(loader, registry, LoadConfig::default())
    }

    async fn collect(mut stream: GenerationStream) -> Vec<StreamToken> {
        let mut units = Vec::new();
        while let Some(unit) = stream.next().await {
            units.push(unit);
        }
        units
    }

    #[tokio::test]
    async fn test_load_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let loader = Arc::new(StubLoader::new(&["x"]));
        let registry = registry_with(&dir, &[("demo-model", b"gguf")]);
        let session = session(Arc::clone(&loader), Arc::clone(&registry));

        assert!(session.load("demo-model").await);
        assert!(session.load("Demo-Model").await);
        assert_eq!(loader.loads.load(Ordering::SeqCst), 1);
        assert_eq!(session.loaded_model().await.as_deref(), Some("demo-model"));
        assert!(registry.get("demo-model").unwrap().is_loaded);
    }

    #[tokio::test]
    async fn test_switching_models_never_holds_two_handles() {
        let dir = tempfile::tempdir().unwrap();
        let loader = Arc::new(StubLoader::new(&["x"]));
        let registry = registry_with(&dir, &[("first", b"gguf"), ("second", b"gguf")]);
        let session = session(Arc::clone(&loader), Arc::clone(&registry));

        assert!(session.load("first").await);
        assert!(session.load("second").await);
        assert_eq!(loader.max_live.load(Ordering::SeqCst), 1);
        assert!(!registry.get("first").unwrap().is_loaded);
        assert!(registry.get("second").unwrap().is_loaded);
    }

    #[tokio::test]
    async fn test_failed_load_leaves_nothing_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let loader = Arc::new(StubLoader::new(&["x"]));
        let registry = registry_with(&dir, &[("good", b"gguf"), ("broken", b"corrupt")]);
        let session = session(Arc::clone(&loader), Arc::clone(&registry));

        assert!(session.load("good").await);
        assert!(!session.load("broken").await);
        assert!(session.loaded_model().await.is_none());
        assert_eq!(loader.live.load(Ordering::SeqCst), 0);
        assert!(!registry.get("good").unwrap().is_loaded);
        assert!(!registry.get("broken").unwrap().is_loaded);

        assert!(!session.load("unknown").await);
        assert!(session.loaded_model().await.is_none());
    }

    #[tokio::test]
    async fn test_missing_file_fails_load() {
        let dir = tempfile::tempdir().unwrap();
        let loader = Arc::new(StubLoader::new(&["x"]));
        let registry = registry_with(&dir, &[("gone", b"gguf")]);
        std::fs::remove_file(dir.path().join("gone.gguf")).unwrap();
        let session = session(Arc::clone(&loader), registry);

        assert!(!session.load("gone").await);
        assert_eq!(loader.loads.load(Ordering::SeqCst), 0);
        assert!(session.loaded_model().await.is_none());
    }

    #[tokio::test]
    async fn test_unload_without_model_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let session = session(Arc::new(StubLoader::new(&[])), registry_with(&dir, &[]));
        session.unload().await;
        session.unload().await;
        assert!(session.loaded_model().await.is_none());
    }

    #[tokio::test]
    async fn test_unload_releases_handle() {
        let dir = tempfile::tempdir().unwrap();
        let loader = Arc::new(StubLoader::new(&["x"]));
        let registry = registry_with(&dir, &[("demo-model", b"gguf")]);
        let session = session(Arc::clone(&loader), Arc::clone(&registry));

        assert!(session.load("demo-model").await);
        session.unload().await;
        assert_eq!(loader.live.load(Ordering::SeqCst), 0);
        assert!(session.loaded_model().await.is_none());
        assert!(!registry.get("demo-model").unwrap().is_loaded);
    }

    #[tokio::test]
    async fn test_generate_without_model_yields_one_error() {
        let dir = tempfile::tempdir().unwrap();
        let session = session(Arc::new(StubLoader::new(&["x"])), registry_with(&dir, &[]));

        let units = collect(session.generate(&[], "", "Hi", SamplingParameters::default()).await).await;
        assert_eq!(units, vec![StreamToken::Error(NO_MODEL_MESSAGE.to_string())]);
    }

    #[tokio::test]
    async fn test_generate_hello_world() {
        let dir = tempfile::tempdir().unwrap();
        let loader = Arc::new(StubLoader::new(&["Hello", " world"]));
        let session = session(Arc::clone(&loader), registry_with(&dir, &[("demo-model", b"gguf")]));

        assert!(session.load("demo-model").await);
        let units = collect(session.generate(&[], "", "Hi", SamplingParameters::default()).await).await;
        assert_eq!(
            units,
            vec![
                StreamToken::Token("Hello".to_string()),
                StreamToken::Token(" world".to_string()),
            ]
        );
        let text: String = units.iter().map(|u| u.text()).collect();
        assert_eq!(text, "Hello world");

        let prompts = loader.prompts.lock().unwrap();
        assert_eq!(prompts[0], "User: Hi\nAssistant:");
    }

    #[tokio::test]
    async fn test_generate_cleans_echoed_label() {
        let dir = tempfile::tempdir().unwrap();
        let loader = Arc::new(StubLoader::new(&["Assistant", ":", " The", " answer", " is 4.", "\nUser:", " more"]));
        let session = session(loader, registry_with(&dir, &[("demo-model", b"gguf")]));

        assert!(session.load("demo-model").await);
        let text = session
            .generate(&[], "You add numbers.", "2+2?", SamplingParameters::default())
            .await
            .collect_text()
            .await;
        assert_eq!(text, "The answer is 4.");
    }

    #[tokio::test]
    async fn test_mid_stream_failure_ends_with_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut loader = StubLoader::new(&["Partial answer", " continues"]);
        loader.fail_after = true;
        let session = session(Arc::new(loader), registry_with(&dir, &[("demo-model", b"gguf")]));

        assert!(session.load("demo-model").await);
        let units = collect(session.generate(&[], "", "Hi", SamplingParameters::default()).await).await;
        assert_eq!(units.len(), 3);
        assert!(units[..2].iter().all(|u| !u.is_error()));
        assert!(units[2].is_error());
        assert!(units[2].text().contains("native failure"));
    }

    #[tokio::test]
    async fn test_dropping_stream_stops_producer() {
        let dir = tempfile::tempdir().unwrap();
        let pieces: Vec<String> = (0..10_000).map(|i| format!("word{i} ")).collect();
        let piece_refs: Vec<&str> = pieces.iter().map(String::as_str).collect();
        let loader = Arc::new(StubLoader::new(&piece_refs));
        let session = session(Arc::clone(&loader), registry_with(&dir, &[("demo-model", b"gguf")]));

        assert!(session.load("demo-model").await);
        let mut stream = session.generate(&[], "", "Hi", SamplingParameters::default()).await;
        assert!(stream.next().await.is_some());
        drop(stream);

        // The lock is only free again once the worker has stopped
        session.unload().await;
        assert!(loader.emitted.load(Ordering::SeqCst) < 10_000);
    }

    fn long_loader() -> Arc<StubLoader> {
        let pieces: Vec<String> = (0..500).map(|i| format!("word{i} ")).collect();
        let piece_refs: Vec<&str> = pieces.iter().map(String::as_str).collect();
        Arc::new(StubLoader::new(&piece_refs))
    }

    async fn drain(stream: &mut GenerationStream) -> usize {
        let mut count = 0;
        while stream.next().await.is_some() {
            count += 1;
        }
        count
    }

    #[tokio::test]
    async fn test_load_waits_for_open_stream() {
        let dir = tempfile::tempdir().unwrap();
        let loader = long_loader();
        let registry = registry_with(&dir, &[("first", b"gguf"), ("second", b"gguf")]);
        let session = Arc::new(session(Arc::clone(&loader), registry));

        assert!(session.load("first").await);
        let mut stream = session.generate(&[], "", "Hi", SamplingParameters::default()).await;
        assert!(stream.next().await.is_some());

        let switch = tokio::spawn({
            let session = Arc::clone(&session);
            async move { session.load("second").await }
        });
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert!(!switch.is_finished());

        // The open stream still belongs to the first model and runs to the end
        assert_eq!(drain(&mut stream).await, 499);
        assert!(switch.await.unwrap());
        assert_eq!(session.loaded_model().await.as_deref(), Some("second"));
        assert_eq!(loader.max_live.load(Ordering::SeqCst), 1);
        assert_eq!(loader.loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_second_generate_queues_behind_first() {
        let dir = tempfile::tempdir().unwrap();
        let loader = long_loader();
        let session = Arc::new(session(Arc::clone(&loader), registry_with(&dir, &[("demo-model", b"gguf")])));

        assert!(session.load("demo-model").await);
        let mut first = session.generate(&[], "", "one", SamplingParameters::default()).await;
        assert!(first.next().await.is_some());

        let second = tokio::spawn({
            let session = Arc::clone(&session);
            async move { session.generate(&[], "", "two", SamplingParameters::default()).await }
        });
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert!(!second.is_finished());
        assert_eq!(loader.prompts.lock().unwrap().len(), 1);

        drop(first);
        let mut second = second.await.unwrap();
        assert_eq!(drain(&mut second).await, 500);

        let prompts = loader.prompts.lock().unwrap();
        assert_eq!(prompts.len(), 2);
        assert!(prompts[1].contains("User: two"));
        assert_eq!(loader.max_live.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_generate_with_model_loads_first() {
        let dir = tempfile::tempdir().unwrap();
        let loader = Arc::new(StubLoader::new(&["Hello", " there"]));
        let session = session(Arc::clone(&loader), registry_with(&dir, &[("demo-model", b"gguf")]));

        let text = session
            .generate_with_model("DEMO-MODEL", &[], "", "Hi", SamplingParameters::default())
            .await
            .collect_text()
            .await;
        assert_eq!(text, "Hello there");
        assert_eq!(session.loaded_model().await.as_deref(), Some("demo-model"));

        let units = collect(
            session
                .generate_with_model("missing", &[], "", "Hi", SamplingParameters::default())
                .await,
        )
        .await;
        assert_eq!(units.len(), 1);
        assert!(units[0].is_error());
        assert!(session.loaded_model().await.is_none());
    }

    #[tokio::test]
    async fn test_history_window_applies_to_prompt() {
        let dir = tempfile::tempdir().unwrap();
        let loader = Arc::new(StubLoader::new(&["ok then"]));
        let session = session(Arc::clone(&loader), registry_with(&dir, &[("demo-model", b"gguf")]));
        assert!(session.load("demo-model").await);

        let history: Vec<ConversationTurn> = (1..=5)
            .map(|i| {
                if i % 2 == 1 {
                    ConversationTurn::user(format!("turn {i}"))
                } else {
                    ConversationTurn::assistant(format!("turn {i}"))
                }
            })
            .collect();
        session
            .generate(&history, "", "next", SamplingParameters::default())
            .await
            .collect_text()
            .await;

        let prompts = loader.prompts.lock().unwrap();
        assert!(!prompts[0].contains("turn 1"));
        assert!(!prompts[0].contains("turn 2"));
        assert!(prompts[0].contains("turn 3"));
    }
}
