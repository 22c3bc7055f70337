//! Mock Backend
//!
//! In-process backend for tests and dry runs. It never touches the network:
//! responses come from a script of queued outcomes, then a default answer.
//!
//! # Usage
//!
//! ```ignore
//! use switchboard_core::backend::MockBackend;
//!
//! let backend = MockBackend::new("mock-a", "mock-model")
//!     .with_failures(2, "503 service unavailable")
//!     .with_response("done");
//!
//! // ...drive it through the registry...
//! assert_eq!(backend.execute_count(), 3);
//! ```
//!
//! From configuration, the `mock` type reads three optional parameters:
//! `response` (default answer), `fail_init` and `fail_shutdown` (failure text).

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use super::traits::{estimate_tokens, Backend, BackendRequest, BackendResponse, ChatMessage};
use crate::cache::prompt::{stable_prefix_key, CacheUsage, CachedChatResponse, CachedMessage};
use crate::config::{BackendDescriptor, BackendType};
use crate::error::BackendError;

/// Scripted backend
pub struct MockBackend {
    id: String,
    model: String,
    default_response: String,
    script: Mutex<VecDeque<Result<String, BackendError>>>,
    init_error: Option<BackendError>,
    init_delay: Option<Duration>,
    execute_delay: Option<Duration>,
    partial_error: Option<String>,
    shutdown_error: Option<BackendError>,
    shutdown_delay: Option<Duration>,
    prompt_caching: bool,
    warm_prefixes: Mutex<HashSet<String>>,
    history: Mutex<Vec<BackendRequest>>,
    init_calls: AtomicUsize,
    execute_calls: AtomicUsize,
    shutdown_calls: AtomicUsize,
}

impl std::fmt::Debug for MockBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockBackend")
            .field("id", &self.id)
            .field("model", &self.model)
            .field("prompt_caching", &self.prompt_caching)
            .finish_non_exhaustive()
    }
}

impl MockBackend {
    /// Create a backend that always answers with a canned response
    pub fn new(id: impl Into<String>, model: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            default_response: format!("Response from {id}"),
            id,
            model: model.into(),
            script: Mutex::new(VecDeque::new()),
            init_error: None,
            init_delay: None,
            execute_delay: None,
            partial_error: None,
            shutdown_error: None,
            shutdown_delay: None,
            prompt_caching: false,
            warm_prefixes: Mutex::new(HashSet::new()),
            history: Mutex::new(Vec::new()),
            init_calls: AtomicUsize::new(0),
            execute_calls: AtomicUsize::new(0),
            shutdown_calls: AtomicUsize::new(0),
        }
    }

    /// Build from a `mock` descriptor
    #[must_use]
    pub fn from_descriptor(descriptor: &BackendDescriptor) -> Self {
        let text = |key: &str| descriptor.parameters.get(key).and_then(Value::as_str);

        let mut backend = Self::new(&descriptor.id, &descriptor.model);
        if let Some(response) = text("response") {
            backend = backend.with_response(response);
        }
        if let Some(reason) = text("fail_init") {
            backend = backend.with_init_failure(reason);
        }
        if let Some(reason) = text("fail_shutdown") {
            backend = backend.with_shutdown_failure(reason);
        }
        backend
    }

    /// Set the default answer
    #[must_use]
    pub fn with_response(mut self, response: impl Into<String>) -> Self {
        self.default_response = response.into();
        self
    }

    /// Queue one outcome ahead of the default answer
    #[must_use]
    pub fn with_outcome(self, outcome: Result<String, BackendError>) -> Self {
        self.script.lock().push_back(outcome);
        self
    }

    /// Queue `count` failures classified from `reason`
    #[must_use]
    pub fn with_failures(self, count: usize, reason: &str) -> Self {
        {
            let mut script = self.script.lock();
            for _ in 0..count {
                script.push_back(Err(BackendError::classify(reason)));
            }
        }
        self
    }

    /// Fail `initialize` with a classified error
    #[must_use]
    pub fn with_init_failure(mut self, reason: &str) -> Self {
        self.init_error = Some(BackendError::classify(reason));
        self
    }

    /// Delay `initialize`
    #[must_use]
    pub fn with_init_delay(mut self, delay: Duration) -> Self {
        self.init_delay = Some(delay);
        self
    }

    /// Delay every `execute`
    #[must_use]
    pub fn with_execute_delay(mut self, delay: Duration) -> Self {
        self.execute_delay = Some(delay);
        self
    }

    /// Answer normally but flag every response with `reason` (a truncated or
    /// filtered completion)
    #[must_use]
    pub fn with_partial_error(mut self, reason: impl Into<String>) -> Self {
        self.partial_error = Some(reason.into());
        self
    }

    /// Fail `shutdown` with a classified error
    #[must_use]
    pub fn with_shutdown_failure(mut self, reason: &str) -> Self {
        self.shutdown_error = Some(BackendError::classify(reason));
        self
    }

    /// Delay `shutdown`
    #[must_use]
    pub fn with_shutdown_delay(mut self, delay: Duration) -> Self {
        self.shutdown_delay = Some(delay);
        self
    }

    /// Simulate vendor-native prompt caching
    #[must_use]
    pub fn with_prompt_caching(mut self) -> Self {
        self.prompt_caching = true;
        self
    }

    /// Number of `initialize` calls
    pub fn init_count(&self) -> usize {
        self.init_calls.load(Ordering::SeqCst)
    }

    /// Number of `execute` calls (including those made through `chat`)
    pub fn execute_count(&self) -> usize {
        self.execute_calls.load(Ordering::SeqCst)
    }

    /// Number of `shutdown` calls
    pub fn shutdown_count(&self) -> usize {
        self.shutdown_calls.load(Ordering::SeqCst)
    }

    /// Requests seen so far
    pub fn history(&self) -> Vec<BackendRequest> {
        self.history.lock().clone()
    }

    async fn pause(delay: Option<Duration>) {
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl Backend for MockBackend {
    fn name(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> BackendType {
        BackendType::Mock
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn initialize(&self) -> Result<(), BackendError> {
        self.init_calls.fetch_add(1, Ordering::SeqCst);
        Self::pause(self.init_delay).await;
        match &self.init_error {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    async fn execute(&self, request: &BackendRequest) -> Result<BackendResponse, BackendError> {
        self.execute_calls.fetch_add(1, Ordering::SeqCst);
        self.history.lock().push(request.clone());
        Self::pause(self.execute_delay).await;

        let outcome = self.script.lock().pop_front();
        let text = match outcome {
            Some(result) => result?,
            None => self.default_response.clone(),
        };
        let mut response = BackendResponse::estimated(&request.prompt, text, &self.model);
        response.error.clone_from(&self.partial_error);
        Ok(response)
    }

    fn supports_prompt_caching(&self) -> bool {
        self.prompt_caching
    }

    async fn chat_with_prompt_cache(
        &self,
        messages: &[CachedMessage],
        request: &BackendRequest,
    ) -> Result<CachedChatResponse, BackendError> {
        let plain: Vec<ChatMessage> = messages.iter().map(CachedMessage::to_chat_message).collect();
        let response = self.chat(&plain, request).await?;
        if !self.prompt_caching {
            let usage = CacheUsage {
                input_tokens: u64::from(response.prompt_tokens),
                output_tokens: u64::from(response.completion_tokens),
                ..CacheUsage::default()
            };
            return Ok(CachedChatResponse { response, usage });
        }

        let token_sum = |cached: bool| -> u64 {
            messages
                .iter()
                .filter(|m| m.cache_control.is_some() == cached)
                .map(|m| u64::from(estimate_tokens(&m.content)))
                .sum()
        };
        let cacheable = token_sum(true);
        let mut usage = CacheUsage {
            input_tokens: token_sum(false),
            output_tokens: u64::from(response.completion_tokens),
            ..CacheUsage::default()
        };

        if let Some(key) = stable_prefix_key(messages) {
            if self.warm_prefixes.lock().insert(key) {
                usage.cache_creation_input_tokens = cacheable;
            } else {
                usage.cache_read_input_tokens = cacheable;
            }
        }

        Ok(CachedChatResponse { response, usage })
    }

    async fn shutdown(&self) -> Result<(), BackendError> {
        self.shutdown_calls.fetch_add(1, Ordering::SeqCst);
        Self::pause(self.shutdown_delay).await;
        match &self.shutdown_error {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}
