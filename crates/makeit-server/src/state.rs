use std::sync::Arc;

use makeit::history::HistoryStore;
use makeit::providers::openai::OpenAiProvider;
use makeit::reply::ReplyService;
use makeit::store::{JsonFileStore, KeyValueStore, MemoryStore};
use makeit::toolbox::WebSearch;
use makeit::turn::TurnController;

use crate::configuration::{Settings, StoreSettings};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub replies: ReplyService,
}

impl AppState {
    pub fn new(replies: ReplyService) -> Self {
        Self { replies }
    }

    /// Wire the provider, search tool and store named by the settings
    pub fn from_settings(settings: Settings) -> anyhow::Result<Self> {
        let provider = OpenAiProvider::new(settings.provider.into_config())?;
        let search = WebSearch::new(settings.search.into_config())?;

        let store: Arc<dyn KeyValueStore> = match settings.store {
            StoreSettings::Memory => {
                tracing::warn!("using the in-memory store, sessions are lost on restart");
                Arc::new(MemoryStore::new())
            }
            StoreSettings::File { root } => Arc::new(JsonFileStore::new(root)),
        };
        let history = HistoryStore::new(store, settings.tables.into_tables());

        let mut controller = TurnController::new(Arc::new(provider))
            .with_max_tool_rounds(settings.agent.max_tool_rounds);
        controller.add_toolbox(Arc::new(search));

        Ok(Self::new(ReplyService::new(controller, history)))
    }

    pub fn history(&self) -> &HistoryStore {
        self.replies.history()
    }
}
