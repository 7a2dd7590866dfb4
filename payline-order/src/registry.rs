use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use payline_catalog::{Channel, ProviderKind};
use payline_core::payment::{PaymentProvider, ProviderFactory};
use payline_core::{CoreError, CoreResult};

/// Resolves channel configuration into live provider clients and caches them.
///
/// Lookups take the read lock only. On a miss the client is built with no lock
/// held (construction may authenticate over the network), then inserted under
/// the write lock unless another caller won the race, in which case the fresh
/// instance is dropped and the cached one returned. Failed builds are never cached.
pub struct ProviderRegistry {
    factory: Arc<dyn ProviderFactory>,
    cache: RwLock<HashMap<String, Arc<dyn PaymentProvider>>>,
}

impl ProviderRegistry {
    pub fn new(factory: Arc<dyn ProviderFactory>) -> Self {
        Self {
            factory,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// `provider|k1=v1;k2=v2;` with keys sorted, independent of map iteration order.
    /// `\`, `=` and `;` inside keys and values are backslash-escaped.
    pub fn cache_key<'a, I>(kind: ProviderKind, config: I) -> String
    where
        I: IntoIterator<Item = (&'a String, &'a String)>,
    {
        let mut pairs: Vec<(&String, &String)> = config.into_iter().collect();
        pairs.sort();
        let mut key = format!("{}|", kind.as_str());
        for (k, v) in pairs {
            push_escaped(&mut key, k);
            key.push('=');
            push_escaped(&mut key, v);
            key.push(';');
        }
        key
    }

    pub async fn get(
        &self,
        kind: ProviderKind,
        config: &BTreeMap<String, String>,
    ) -> CoreResult<Arc<dyn PaymentProvider>> {
        let key = Self::cache_key(kind, config);

        if let Some(provider) = self.lookup(&key) {
            return Ok(provider);
        }

        let built = self
            .factory
            .build(kind, config)
            .await
            .map_err(|e| CoreError::ConfigurationError(format!("{}: {}", kind.as_str(), e)))?;

        let mut cache = match self.cache.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let provider = cache.entry(key).or_insert(built).clone();
        tracing::debug!(provider = kind.as_str(), cached = cache.len(), "Provider client resolved");
        Ok(provider)
    }

    pub async fn for_channel(&self, channel: &Channel) -> CoreResult<Arc<dyn PaymentProvider>> {
        self.get(channel.provider, channel.config.expose()).await
    }

    /// Drop every cached client, e.g. after credentials were rotated
    pub fn clear(&self) {
        let mut cache = match self.cache.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        cache.clear();
        tracing::info!("Provider cache cleared");
    }

    pub fn len(&self) -> usize {
        match self.cache.read() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lookup(&self, key: &str) -> Option<Arc<dyn PaymentProvider>> {
        match self.cache.read() {
            Ok(guard) => guard.get(key).cloned(),
            Err(poisoned) => poisoned.into_inner().get(key).cloned(),
        }
    }
}

fn push_escaped(key: &mut String, part: &str) {
    for c in part.chars() {
        if matches!(c, '\\' | '=' | ';') {
            key.push('\\');
        }
        key.push(c);
    }
}
