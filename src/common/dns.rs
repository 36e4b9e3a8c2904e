//! DNS facade: the injected resolver trait, a production resolver
//! backed by hickory, a deterministic mock for tests, and the metered
//! wrapper that enforces per-evaluation lookup budgets.

use std::collections::HashMap;
use std::future::Future;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use hickory_resolver::config::ResolverConfig;
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::TokioResolver;
use tracing::debug;

use crate::common::domain;

/// Resolver-level errors. `NotFound` covers both NXDOMAIN and NODATA;
/// the facade normalizes it to an empty record list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DnsError {
    NotFound,
    TempFail(String),
    PermFail(String),
}

impl std::fmt::Display for DnsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DnsError::NotFound => write!(f, "record not found"),
            DnsError::TempFail(e) => write!(f, "temporary DNS failure: {e}"),
            DnsError::PermFail(e) => write!(f, "permanent DNS failure: {e}"),
        }
    }
}

/// An MX record: exchange host plus preference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MxRecord {
    pub exchange: String,
    pub priority: u16,
}

/// The injected resolver capability. The engine holds no process-wide
/// resolver state; every call threads one of these through.
///
/// Implementations must be callable concurrently. DNS caching is the
/// caller's responsibility — wrap your resolver if you want one.
pub trait DnsResolver: Send + Sync {
    fn query_txt(&self, name: &str) -> impl Future<Output = Result<Vec<String>, DnsError>> + Send;
    fn query_a(&self, name: &str) -> impl Future<Output = Result<Vec<Ipv4Addr>, DnsError>> + Send;
    fn query_aaaa(&self, name: &str)
        -> impl Future<Output = Result<Vec<Ipv6Addr>, DnsError>> + Send;
    fn query_mx(&self, name: &str) -> impl Future<Output = Result<Vec<MxRecord>, DnsError>> + Send;
}

// ---------------------------------------------------------------------------
// Lookup budget
// ---------------------------------------------------------------------------

/// Per-evaluation DNS accounting, shared across concurrent branches of
/// one evaluation (e.g. parallel SPF `include`s) via `&` reference.
///
/// Two limits: a hard total (`max`) and a cap of two *consecutive*
/// void lookups (NXDOMAIN or empty answer).
#[derive(Debug)]
pub struct LookupCounter {
    max: usize,
    used: AtomicUsize,
    void_streak: AtomicUsize,
}

impl LookupCounter {
    pub fn new(max: usize) -> Self {
        Self {
            max,
            used: AtomicUsize::new(0),
            void_streak: AtomicUsize::new(0),
        }
    }

    /// Charge one query against the budget.
    pub fn charge(&self) -> Result<(), DnsError> {
        let used = self.used.fetch_add(1, Ordering::SeqCst) + 1;
        if used > self.max {
            Err(DnsError::PermFail("too many DNS lookups".into()))
        } else {
            Ok(())
        }
    }

    fn record_void(&self) -> Result<(), DnsError> {
        let streak = self.void_streak.fetch_add(1, Ordering::SeqCst) + 1;
        if streak > 2 {
            Err(DnsError::PermFail("too many void DNS lookups".into()))
        } else {
            Ok(())
        }
    }

    fn record_answer(&self) {
        self.void_streak.store(0, Ordering::SeqCst);
    }

    pub fn used(&self) -> usize {
        self.used.load(Ordering::SeqCst)
    }
}

/// Typed, metered view over an injected resolver.
///
/// Every call validates domain syntax, converts to A-labels, charges
/// the shared counter, and normalizes NXDOMAIN/NODATA to an empty
/// list. Transport failures surface as [`DnsError::TempFail`].
pub struct MeteredDns<'a, R: DnsResolver> {
    resolver: &'a R,
    counter: &'a LookupCounter,
}

impl<'a, R: DnsResolver> MeteredDns<'a, R> {
    pub fn new(resolver: &'a R, counter: &'a LookupCounter) -> Self {
        Self { resolver, counter }
    }

    pub fn counter(&self) -> &LookupCounter {
        self.counter
    }

    fn prepare(&self, name: &str) -> Result<String, DnsError> {
        let ascii = domain::to_ascii(name).map_err(DnsError::PermFail)?;
        if !domain::is_valid_hostname(&ascii) {
            return Err(DnsError::PermFail(format!("invalid domain name: {name}")));
        }
        self.counter.charge()?;
        Ok(ascii)
    }

    fn account<T>(&self, result: Result<Vec<T>, DnsError>) -> Result<Vec<T>, DnsError> {
        match result {
            Ok(records) if records.is_empty() => {
                self.counter.record_void()?;
                Ok(records)
            }
            Ok(records) => {
                self.counter.record_answer();
                Ok(records)
            }
            Err(DnsError::NotFound) => {
                self.counter.record_void()?;
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }

    pub async fn txt(&self, name: &str) -> Result<Vec<String>, DnsError> {
        let name = self.prepare(name)?;
        debug!(name = %name, "TXT lookup");
        let result = self.resolver.query_txt(&name).await;
        self.account(result)
    }

    pub async fn a(&self, name: &str) -> Result<Vec<Ipv4Addr>, DnsError> {
        let name = self.prepare(name)?;
        debug!(name = %name, "A lookup");
        let result = self.resolver.query_a(&name).await;
        self.account(result)
    }

    pub async fn aaaa(&self, name: &str) -> Result<Vec<Ipv6Addr>, DnsError> {
        let name = self.prepare(name)?;
        debug!(name = %name, "AAAA lookup");
        let result = self.resolver.query_aaaa(&name).await;
        self.account(result)
    }

    pub async fn mx(&self, name: &str) -> Result<Vec<MxRecord>, DnsError> {
        let name = self.prepare(name)?;
        debug!(name = %name, "MX lookup");
        let result = self.resolver.query_mx(&name).await;
        self.account(result)
    }
}

// ---------------------------------------------------------------------------
// Production resolver
// ---------------------------------------------------------------------------

/// Production resolver on top of hickory's Tokio resolver.
#[derive(Clone)]
pub struct HickoryResolver {
    resolver: TokioResolver,
}

impl HickoryResolver {
    /// Resolver using Cloudflare's public servers.
    pub fn new() -> Self {
        let resolver = TokioResolver::builder_with_config(
            ResolverConfig::cloudflare(),
            TokioConnectionProvider::default(),
        )
        .build();
        Self { resolver }
    }
}

impl Default for HickoryResolver {
    fn default() -> Self {
        Self::new()
    }
}

fn map_resolve_error(e: hickory_resolver::ResolveError) -> DnsError {
    if e.is_nx_domain() || e.is_no_records_found() {
        DnsError::NotFound
    } else {
        // Timeouts, SERVFAIL, transport problems: all retryable.
        DnsError::TempFail(e.to_string())
    }
}

impl DnsResolver for HickoryResolver {
    async fn query_txt(&self, name: &str) -> Result<Vec<String>, DnsError> {
        match self.resolver.txt_lookup(name).await {
            Ok(lookup) => Ok(lookup
                .iter()
                .map(|txt| {
                    // Multi-string records concatenate verbatim.
                    txt.txt_data()
                        .iter()
                        .map(|part| String::from_utf8_lossy(part).into_owned())
                        .collect::<String>()
                })
                .collect()),
            Err(e) => Err(map_resolve_error(e)),
        }
    }

    async fn query_a(&self, name: &str) -> Result<Vec<Ipv4Addr>, DnsError> {
        match self.resolver.ipv4_lookup(name).await {
            Ok(lookup) => Ok(lookup.iter().map(|a| a.0).collect()),
            Err(e) => Err(map_resolve_error(e)),
        }
    }

    async fn query_aaaa(&self, name: &str) -> Result<Vec<Ipv6Addr>, DnsError> {
        match self.resolver.ipv6_lookup(name).await {
            Ok(lookup) => Ok(lookup.iter().map(|a| a.0).collect()),
            Err(e) => Err(map_resolve_error(e)),
        }
    }

    async fn query_mx(&self, name: &str) -> Result<Vec<MxRecord>, DnsError> {
        match self.resolver.mx_lookup(name).await {
            Ok(lookup) => Ok(lookup
                .iter()
                .map(|mx| MxRecord {
                    exchange: mx.exchange().to_string().trim_end_matches('.').to_string(),
                    priority: mx.preference(),
                })
                .collect()),
            Err(e) => Err(map_resolve_error(e)),
        }
    }
}

// ---------------------------------------------------------------------------
// Test double
// ---------------------------------------------------------------------------

/// In-memory resolver for tests and offline evaluation. Missing names
/// answer NXDOMAIN; specific errors can be injected per name.
#[derive(Clone, Default)]
pub struct MockResolver {
    txt: Arc<RwLock<HashMap<String, Vec<String>>>>,
    a: Arc<RwLock<HashMap<String, Vec<Ipv4Addr>>>>,
    aaaa: Arc<RwLock<HashMap<String, Vec<Ipv6Addr>>>>,
    mx: Arc<RwLock<HashMap<String, Vec<MxRecord>>>>,
    failures: Arc<RwLock<HashMap<String, DnsError>>>,
}

impl MockResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_txt<S: Into<String>>(&self, name: &str, records: Vec<S>) {
        self.txt.write().unwrap().insert(
            name.to_lowercase(),
            records.into_iter().map(Into::into).collect(),
        );
    }

    pub fn add_a(&self, name: &str, addrs: Vec<Ipv4Addr>) {
        self.a.write().unwrap().insert(name.to_lowercase(), addrs);
    }

    pub fn add_aaaa(&self, name: &str, addrs: Vec<Ipv6Addr>) {
        self.aaaa.write().unwrap().insert(name.to_lowercase(), addrs);
    }

    pub fn add_mx(&self, name: &str, exchanges: Vec<(&str, u16)>) {
        self.mx.write().unwrap().insert(
            name.to_lowercase(),
            exchanges
                .into_iter()
                .map(|(exchange, priority)| MxRecord {
                    exchange: exchange.to_string(),
                    priority,
                })
                .collect(),
        );
    }

    /// Make every query against `name` return the given error.
    pub fn fail(&self, name: &str, error: DnsError) {
        self.failures
            .write()
            .unwrap()
            .insert(name.to_lowercase(), error);
    }

    fn check_failure(&self, name: &str) -> Result<(), DnsError> {
        match self.failures.read().unwrap().get(&name.to_lowercase()) {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }
}

impl DnsResolver for MockResolver {
    async fn query_txt(&self, name: &str) -> Result<Vec<String>, DnsError> {
        self.check_failure(name)?;
        self.txt
            .read()
            .unwrap()
            .get(&name.to_lowercase())
            .cloned()
            .ok_or(DnsError::NotFound)
    }

    async fn query_a(&self, name: &str) -> Result<Vec<Ipv4Addr>, DnsError> {
        self.check_failure(name)?;
        self.a
            .read()
            .unwrap()
            .get(&name.to_lowercase())
            .cloned()
            .ok_or(DnsError::NotFound)
    }

    async fn query_aaaa(&self, name: &str) -> Result<Vec<Ipv6Addr>, DnsError> {
        self.check_failure(name)?;
        self.aaaa
            .read()
            .unwrap()
            .get(&name.to_lowercase())
            .cloned()
            .ok_or(DnsError::NotFound)
    }

    async fn query_mx(&self, name: &str) -> Result<Vec<MxRecord>, DnsError> {
        self.check_failure(name)?;
        self.mx
            .read()
            .unwrap()
            .get(&name.to_lowercase())
            .cloned()
            .ok_or(DnsError::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn counter_enforces_budget() {
        let resolver = MockResolver::new();
        resolver.add_txt("example.com", vec!["hello"]);

        let counter = LookupCounter::new(2);
        let dns = MeteredDns::new(&resolver, &counter);

        assert!(dns.txt("example.com").await.is_ok());
        assert!(dns.txt("example.com").await.is_ok());
        let err = dns.txt("example.com").await.unwrap_err();
        assert_eq!(err, DnsError::PermFail("too many DNS lookups".into()));
        assert_eq!(counter.used(), 3);
    }

    #[tokio::test]
    async fn nxdomain_normalizes_to_empty() {
        let resolver = MockResolver::new();
        let counter = LookupCounter::new(10);
        let dns = MeteredDns::new(&resolver, &counter);

        assert_eq!(dns.txt("missing.example.com").await.unwrap(), Vec::<String>::new());
    }

    #[tokio::test]
    async fn third_consecutive_void_is_permfail() {
        let resolver = MockResolver::new();
        let counter = LookupCounter::new(10);
        let dns = MeteredDns::new(&resolver, &counter);

        assert!(dns.txt("a.example.com").await.is_ok());
        assert!(dns.txt("b.example.com").await.is_ok());
        assert!(matches!(
            dns.txt("c.example.com").await,
            Err(DnsError::PermFail(_))
        ));
    }

    #[tokio::test]
    async fn answer_resets_void_streak() {
        let resolver = MockResolver::new();
        resolver.add_txt("live.example.com", vec!["x"]);

        let counter = LookupCounter::new(10);
        let dns = MeteredDns::new(&resolver, &counter);

        assert!(dns.txt("a.example.com").await.is_ok());
        assert!(dns.txt("b.example.com").await.is_ok());
        assert!(dns.txt("live.example.com").await.is_ok());
        assert!(dns.txt("c.example.com").await.is_ok());
    }

    #[tokio::test]
    async fn invalid_domain_is_permfail_before_query() {
        let resolver = MockResolver::new();
        let counter = LookupCounter::new(10);
        let dns = MeteredDns::new(&resolver, &counter);

        assert!(matches!(
            dns.txt("bad..domain").await,
            Err(DnsError::PermFail(_))
        ));
        // Rejected before the counter was charged.
        assert_eq!(counter.used(), 0);
    }

    #[tokio::test]
    async fn temp_failures_pass_through() {
        let resolver = MockResolver::new();
        resolver.fail("flaky.example.com", DnsError::TempFail("timeout".into()));

        let counter = LookupCounter::new(10);
        let dns = MeteredDns::new(&resolver, &counter);

        assert!(matches!(
            dns.txt("flaky.example.com").await,
            Err(DnsError::TempFail(_))
        ));
    }

    #[tokio::test]
    async fn idn_queries_use_a_labels() {
        let resolver = MockResolver::new();
        resolver.add_txt("xn--bcher-kva.example", vec!["v=spf1 -all"]);

        let counter = LookupCounter::new(10);
        let dns = MeteredDns::new(&resolver, &counter);

        let records = dns.txt("bücher.example").await.unwrap();
        assert_eq!(records, vec!["v=spf1 -all".to_string()]);
    }
}
