pub mod http;
pub mod rules;
pub mod source;

pub use http::{
    AuthInterceptor, Credential, FixtureReply, FixtureTransport, HeaderInterceptor, HostsInterceptor,
    HttpClient, HttpClientBuilder, HttpRequest, HttpResponse, Interceptor, NetworkStats, Next,
    ReqwestTransport, RetryInterceptor, StatsInterceptor, Transport, TransportConfig,
};
pub use rules::{CompiledRules, RuleEngine, RuleEngineFactory, RuleLinker, RulePack};
pub use source::ClientPackageSource;

use arachne_core::config::ArachneConfig;
use arachne_core::error::AppError;
use arachne_core::hub::ResolverHub;

/// A hub wired with rule-pack resolvers over the HTTP client.
pub type RuleHub = ResolverHub<RuleLinker, ClientPackageSource, RuleEngineFactory<HttpClient>>;

/// Initialize a [`RuleHub`] whose packages and pages are both fetched
/// through `client`.
pub async fn rule_hub(config: ArachneConfig, client: HttpClient) -> Result<RuleHub, AppError> {
    ResolverHub::init(
        config,
        RuleLinker,
        ClientPackageSource::new(client.clone()),
        RuleEngineFactory::new(client),
    )
    .await
}
