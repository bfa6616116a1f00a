use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use lru::LruCache;
use parking_lot::Mutex;

use telemesh_attr::{AttributeBag, AttributeValue, ValueType, Vocabulary};

use crate::compile;
use crate::errors::ExprError;
use crate::program::Program;
use crate::vm;

pub const DEFAULT_CACHE_SIZE: usize = 1024;

type CacheKey = (u64, String);

/// Compiles and evaluates attribute expressions with a per-vocabulary LRU of
/// compiled programs. `change_vocabulary` swaps the finder atomically; old
/// cache entries are keyed by the retired vocabulary id and simply stop
/// being hit, no synchronous eviction.
pub struct Evaluator {
    vocabulary: ArcSwap<Vocabulary>,
    cache: Mutex<LruCache<CacheKey, Arc<Program>>>,
    inflight: Mutex<HashMap<CacheKey, Arc<Mutex<()>>>>,
    compiles: AtomicU64,
}

impl Evaluator {
    pub fn new(cache_size: usize) -> Self {
        let capacity = NonZeroUsize::new(cache_size.max(1)).unwrap();
        Self {
            vocabulary: ArcSwap::from_pointee(Vocabulary::empty()),
            cache: Mutex::new(LruCache::new(capacity)),
            inflight: Mutex::new(HashMap::new()),
            compiles: AtomicU64::new(0),
        }
    }

    /// Atomically replaces the active vocabulary. Programs compiled against
    /// earlier vocabularies stay valid for whoever already holds them but are
    /// rejected by `eval_program` on this evaluator.
    pub fn change_vocabulary(&self, vocabulary: Arc<Vocabulary>) {
        self.vocabulary.store(vocabulary);
    }

    pub fn vocabulary(&self) -> Arc<Vocabulary> {
        self.vocabulary.load_full()
    }

    /// Cache-through compile with singleflight against the current
    /// vocabulary.
    pub fn compile(&self, text: &str) -> Result<Arc<Program>, ExprError> {
        let vocabulary = self.vocabulary.load_full();
        self.compile_for(text, &vocabulary)
    }

    /// Compile against an explicit vocabulary, which may not be the live one
    /// yet. The planner validates candidate config this way so that nothing
    /// is published until the whole batch holds. Concurrent misses on the
    /// same `(vocabulary, text)` key run one compilation.
    pub fn compile_for(
        &self,
        text: &str,
        vocabulary: &Arc<Vocabulary>,
    ) -> Result<Arc<Program>, ExprError> {
        let key: CacheKey = (vocabulary.id(), text.to_string());

        if let Some(program) = self.cache.lock().get(&key) {
            return Ok(Arc::clone(program));
        }

        let gate = {
            let mut inflight = self.inflight.lock();
            Arc::clone(inflight.entry(key.clone()).or_default())
        };
        let _guard = gate.lock();

        if let Some(program) = self.cache.lock().get(&key) {
            self.inflight.lock().remove(&key);
            return Ok(Arc::clone(program));
        }

        self.compiles.fetch_add(1, Ordering::Relaxed);
        let result = compile::compile(text, &**vocabulary, vocabulary.id());
        let result = match result {
            Ok(program) => {
                let program = Arc::new(program);
                self.cache.lock().put(key.clone(), Arc::clone(&program));
                Ok(program)
            }
            Err(err) => Err(err),
        };
        self.inflight.lock().remove(&key);
        result
    }

    /// Runs an already compiled program; refuses programs from a retired
    /// vocabulary generation.
    pub fn eval_program(
        &self,
        program: &Program,
        bag: &AttributeBag,
    ) -> Result<AttributeValue, ExprError> {
        let current = self.vocabulary.load().id();
        if program.vocabulary_id != current {
            return Err(ExprError::StaleProgram {
                program: program.vocabulary_id,
                current,
            });
        }
        vm::run(program, bag)
    }

    pub fn eval(&self, text: &str, bag: &AttributeBag) -> Result<AttributeValue, ExprError> {
        let program = self.compile(text)?;
        self.eval_program(&program, bag)
    }

    /// String coercion: INT64 results render as decimal; nothing else
    /// coerces.
    pub fn eval_string(&self, text: &str, bag: &AttributeBag) -> Result<String, ExprError> {
        match self.eval(text, bag)? {
            AttributeValue::String(s) => Ok(s),
            AttributeValue::Int64(v) => Ok(v.to_string()),
            other => Err(ExprError::TypeMismatch {
                expected: ValueType::String,
                actual: other.value_type(),
            }),
        }
    }

    pub fn eval_int64(&self, text: &str, bag: &AttributeBag) -> Result<i64, ExprError> {
        match self.eval(text, bag)? {
            AttributeValue::Int64(v) => Ok(v),
            other => Err(ExprError::TypeMismatch {
                expected: ValueType::Int64,
                actual: other.value_type(),
            }),
        }
    }

    pub fn eval_bool(&self, text: &str, bag: &AttributeBag) -> Result<bool, ExprError> {
        match self.eval(text, bag)? {
            AttributeValue::Bool(v) => Ok(v),
            other => Err(ExprError::TypeMismatch {
                expected: ValueType::Bool,
                actual: other.value_type(),
            }),
        }
    }

    /// Like `eval_bool` but additionally requires the program's declared
    /// result type to be BOOL.
    pub fn eval_predicate(&self, text: &str, bag: &AttributeBag) -> Result<bool, ExprError> {
        let program = self.compile(text)?;
        if program.result_type != ValueType::Bool {
            return Err(ExprError::TypeMismatch {
                expected: ValueType::Bool,
                actual: program.result_type,
            });
        }
        match self.eval_program(&program, bag)? {
            AttributeValue::Bool(v) => Ok(v),
            other => Err(ExprError::TypeMismatch {
                expected: ValueType::Bool,
                actual: other.value_type(),
            }),
        }
    }

    /// The type an expression would produce under the current vocabulary.
    pub fn eval_type(&self, text: &str) -> Result<ValueType, ExprError> {
        Ok(self.compile(text)?.result_type)
    }

    /// The type an expression would produce under an explicit vocabulary.
    pub fn eval_type_for(
        &self,
        text: &str,
        vocabulary: &Arc<Vocabulary>,
    ) -> Result<ValueType, ExprError> {
        Ok(self.compile_for(text, vocabulary)?.result_type)
    }

    pub fn assert_type(&self, text: &str, expected: ValueType) -> Result<(), ExprError> {
        let actual = self.eval_type(text)?;
        if actual != expected {
            return Err(ExprError::TypeMismatch { expected, actual });
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn compile_count(&self) -> u64 {
        self.compiles.load(Ordering::Relaxed)
    }
}

impl Default for Evaluator {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_SIZE)
    }
}
