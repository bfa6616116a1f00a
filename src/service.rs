use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use telemesh_attr::{
    wire, AttributeBag, BagPool, GlobalWords, ReferencedAttributes, WireAttributes,
};
use telemesh_core_types::Status;
use telemesh_dispatcher::{Dispatcher, QuotaMethodArgs};

use crate::config::MeshConfig;
use crate::errors::ServiceError;

/// One inbound precondition request, already decoded from the transport
/// frame. `global_word_count` is the prefix of the global word list the
/// caller advertised.
#[derive(Clone, Debug, Default)]
pub struct CheckRequest {
    pub attributes: WireAttributes,
    pub global_word_count: usize,
    pub deduplication_id: String,
    pub quotas: BTreeMap<String, QuotaParams>,
}

#[derive(Clone, Debug, Default)]
pub struct QuotaParams {
    pub amount: i64,
    pub best_effort: bool,
}

#[derive(Clone, Debug, Default)]
pub struct CheckResponse {
    pub precondition: PreconditionResult,
    pub quotas: BTreeMap<String, QuotaResponse>,
}

#[derive(Clone, Debug, Default)]
pub struct PreconditionResult {
    pub status: Status,
    pub valid_duration: Duration,
    pub valid_use_count: i64,
    pub attributes: WireAttributes,
    pub referenced_attributes: ReferencedAttributes,
}

#[derive(Clone, Debug, Default)]
pub struct QuotaResponse {
    pub granted_amount: i64,
    pub valid_duration: Duration,
    pub referenced_attributes: ReferencedAttributes,
}

/// One-way telemetry submission. Blocks after the first are deltas; a block
/// with no words falls back to `default_words`.
#[derive(Clone, Debug, Default)]
pub struct ReportRequest {
    pub attributes: Vec<WireAttributes>,
    pub default_words: Vec<String>,
    pub global_word_count: usize,
}

/// Transport-free service surface: decodes wire attributes, runs the
/// preprocess/check/quota/report phases through the dispatcher, and encodes
/// the response side channel.
pub struct MeshService {
    dispatcher: Arc<Dispatcher>,
    global_words: Arc<GlobalWords>,
    pool: BagPool,
    config: MeshConfig,
}

impl MeshService {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        global_words: Arc<GlobalWords>,
        config: MeshConfig,
    ) -> Self {
        Self {
            dispatcher,
            global_words,
            pool: BagPool::new(),
            config,
        }
    }

    pub async fn check(&self, request: CheckRequest) -> Result<CheckResponse, ServiceError> {
        let root = wire::decode_bag(&request.attributes, &self.global_words)
            .map_err(|err| ServiceError::InvalidArgument(err.to_string()))?;
        let root = Arc::new(root);
        let mut preproc = root.child();

        debug!("dispatching preprocess");
        self.dispatcher
            .preprocess(&root, &mut preproc)
            .await
            .map_err(|err| ServiceError::Internal(err.to_string()))?;

        debug!("dispatching check");
        let mut precondition = match self.dispatcher.check(&preproc).await {
            Ok(Some(result)) => PreconditionResult {
                status: result.status,
                valid_duration: result.valid_duration,
                valid_use_count: result.valid_use_count,
                ..PreconditionResult::default()
            },
            // no rule matched: the configured default applies
            Ok(None) => PreconditionResult {
                status: Status::ok(),
                valid_duration: self.config.default_valid_duration(),
                valid_use_count: self.config.default_valid_use_count,
                ..PreconditionResult::default()
            },
            Err(err) => {
                warn!("check dispatch failed: {err}");
                PreconditionResult {
                    status: Status::internal(err.to_string()),
                    ..PreconditionResult::default()
                }
            }
        };

        let response_bag = self.pool.acquire();
        precondition.attributes =
            wire::encode_bag(&response_bag, &self.global_words, request.global_word_count);
        response_bag.done();

        precondition.referenced_attributes = wire::referenced_to_wire(
            &root.referenced_attributes(),
            &self.global_words,
            request.global_word_count,
        );
        root.clear_referenced();

        let mut response = CheckResponse {
            precondition,
            quotas: BTreeMap::new(),
        };

        // quotas are evaluated last and only when the precondition held
        if response.precondition.status.is_ok() && !request.quotas.is_empty() {
            for (name, params) in &request.quotas {
                let args = QuotaMethodArgs {
                    quota: name.clone(),
                    amount: params.amount,
                    deduplication_id: format!("{}{}", request.deduplication_id, name),
                    best_effort: params.best_effort,
                };
                let mut granted = match self.dispatcher.quota(&preproc, &args).await {
                    Ok(Some(result)) => QuotaResponse {
                        granted_amount: result.amount,
                        valid_duration: result.valid_duration,
                        referenced_attributes: ReferencedAttributes::default(),
                    },
                    // no handler owns this quota: grant what was asked
                    Ok(None) => QuotaResponse {
                        granted_amount: params.amount,
                        valid_duration: self.config.default_valid_duration(),
                        referenced_attributes: ReferencedAttributes::default(),
                    },
                    Err(err) => {
                        warn!(quota = %name, "quota dispatch failed: {err}");
                        response.precondition.status = Status::internal(err.to_string());
                        root.clear_referenced();
                        break;
                    }
                };
                granted.referenced_attributes = wire::referenced_to_wire(
                    &root.referenced_attributes(),
                    &self.global_words,
                    request.global_word_count,
                );
                root.clear_referenced();
                response.quotas.insert(name.clone(), granted);
            }
        }

        Ok(response)
    }

    pub async fn report(&self, request: ReportRequest) -> Result<(), ServiceError> {
        if request.attributes.is_empty() {
            return Ok(());
        }

        let mut blocks = request.attributes;
        for block in &mut blocks {
            if block.words.is_empty() {
                block.words = request.default_words.clone();
            }
        }

        let mut base = wire::decode_bag(&blocks[0], &self.global_words)
            .map_err(|err| ServiceError::InvalidArgument(err.to_string()))?;

        for (i, block) in blocks.iter().enumerate() {
            if i > 0 {
                wire::update_bag_from_wire(&mut base, block, &self.global_words)
                    .map_err(|err| ServiceError::InvalidArgument(err.to_string()))?;
            }

            let root = Arc::new(base);
            let mut preproc = root.child();
            debug!(block = i, "dispatching preprocess");
            self.dispatcher
                .preprocess(&root, &mut preproc)
                .await
                .map_err(|err| ServiceError::Internal(err.to_string()))?;

            debug!(block = i, "dispatching report");
            self.dispatcher
                .report(&preproc)
                .await
                .map_err(|err| ServiceError::Internal(err.to_string()))?;

            drop(preproc);
            base = Arc::try_unwrap(root)
                .unwrap_or_else(|root| AttributeBag::from_wire_values(root.flatten()));
        }

        Ok(())
    }
}
