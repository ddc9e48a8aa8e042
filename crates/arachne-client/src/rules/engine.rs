use std::collections::BTreeMap;
use std::sync::Arc;

use arachne_core::error::AppError;
use arachne_core::models::{
    Capability, DetailRecord, Listing, PlayableSource, ResolverCall, ResolverOutput,
};
use arachne_core::traits::{Engine, EngineFactory, Fetcher};
use url::Url;

use super::extract::{self, absolutize, encode, render};
use super::{CompiledList, CompiledRules};

#[derive(Clone)]
struct Binding {
    key: String,
    rules: Arc<CompiledRules>,
    /// Site root without a trailing slash, as substituted for `{site}`.
    site: String,
    base: Url,
}

impl Binding {
    fn vars(&self, extra: &[(&str, String)]) -> BTreeMap<String, String> {
        let mut vars = BTreeMap::from([("site".to_string(), self.site.clone())]);
        for (name, value) in extra {
            vars.insert(name.to_string(), value.clone());
        }
        vars
    }

    fn failure(&self, message: impl Into<String>) -> AppError {
        AppError::ResolverCallFailure {
            key: self.key.clone(),
            message: message.into(),
        }
    }

    fn unsupported(&self, capability: Capability) -> AppError {
        AppError::UnsupportedCapability {
            key: self.key.clone(),
            capability: capability.to_string(),
        }
    }
}

/// Executes compiled rule packs. One engine serves one resolver at a time.
pub struct RuleEngine<F> {
    fetcher: F,
    binding: Option<Binding>,
}

impl<F: Fetcher> RuleEngine<F> {
    pub fn new(fetcher: F) -> Self {
        Self {
            fetcher,
            binding: None,
        }
    }

    /// Key of the resolver this engine is bound to.
    pub fn bound_key(&self) -> Option<&str> {
        self.binding.as_ref().map(|b| b.key.as_str())
    }

    async fn fetch(&self, binding: &Binding, url: &str) -> Result<String, AppError> {
        tracing::debug!(key = %binding.key, url, "Fetching page");
        self.fetcher
            .fetch_with_headers(url, &binding.rules.headers)
            .await
    }

    async fn list_page(
        &self,
        binding: &Binding,
        pick: fn(&CompiledRules) -> Option<&CompiledList>,
        vars: BTreeMap<String, String>,
    ) -> Result<Vec<arachne_core::models::VodItem>, AppError> {
        let Some(rule) = pick(&binding.rules) else {
            return Ok(Vec::new());
        };
        let url = render(&rule.url, &vars);
        let base = page_base(binding, &url)?;
        let html = self.fetch(binding, &url).await?;

        let rules = Arc::clone(&binding.rules);
        parse(binding, move || {
            pick(&rules)
                .map(|rule| extract::extract_items(&html, &rule.selectors, &base))
                .unwrap_or_default()
        })
        .await
    }

    async fn home(&self, binding: &Binding) -> Result<Listing, AppError> {
        let items = self
            .list_page(binding, |r| r.home.as_ref(), binding.vars(&[]))
            .await?;
        Ok(Listing {
            categories: binding.rules.categories.clone(),
            items,
            page: None,
            page_count: None,
        })
    }

    async fn category(
        &self,
        binding: &Binding,
        type_id: String,
        page: u32,
        filters: BTreeMap<String, String>,
    ) -> Result<Listing, AppError> {
        if binding.rules.category.is_none() {
            return Err(binding.unsupported(Capability::Category));
        }
        let mut vars: BTreeMap<String, String> = filters
            .into_iter()
            .map(|(k, v)| (k, encode(&v)))
            .collect();
        vars.extend(binding.vars(&[("tid", type_id), ("page", page.max(1).to_string())]));

        let items = self
            .list_page(binding, |r| r.category.as_ref(), vars)
            .await?;
        Ok(Listing {
            items,
            page: Some(page.max(1)),
            ..Listing::default()
        })
    }

    async fn search(&self, binding: &Binding, keyword: &str) -> Result<Listing, AppError> {
        if binding.rules.search.is_none() {
            return Err(binding.unsupported(Capability::Search));
        }
        let vars = binding.vars(&[("keyword", encode(keyword)), ("page", "1".to_string())]);
        let items = self.list_page(binding, |r| r.search.as_ref(), vars).await?;
        Ok(Listing {
            items,
            page: Some(1),
            ..Listing::default()
        })
    }

    async fn detail(&self, binding: &Binding, ids: Vec<String>) -> Result<Vec<DetailRecord>, AppError> {
        let Some(rule) = &binding.rules.detail else {
            return Err(binding.unsupported(Capability::Detail));
        };
        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            let url = if is_absolute(&id) {
                id.clone()
            } else {
                render(&rule.url, &binding.vars(&[("id", id.clone())]))
            };
            let base = page_base(binding, &url)?;
            let html = self.fetch(binding, &url).await?;

            let rules = Arc::clone(&binding.rules);
            let record = parse(binding, move || {
                rules
                    .detail
                    .as_ref()
                    .map(|d| extract::extract_detail(&html, &d.selectors, &id, &base))
                    .unwrap_or_default()
            })
            .await?;
            records.push(record);
        }
        Ok(records)
    }

    async fn player(&self, binding: &Binding, flag: String, id: String) -> Result<PlayableSource, AppError> {
        let Some(rule) = &binding.rules.player else {
            return Err(binding.unsupported(Capability::Player));
        };
        let url = match &rule.url {
            None => absolutize(&binding.base, &id),
            Some(template) => {
                let page_url = render(
                    template,
                    &binding.vars(&[("id", id.clone()), ("flag", flag.clone())]),
                );
                match &rule.source {
                    None => page_url,
                    Some(_) => {
                        let base = page_base(binding, &page_url)?;
                        let html = self.fetch(binding, &page_url).await?;
                        let rules = Arc::clone(&binding.rules);
                        let found = parse(binding, move || {
                            rules
                                .player
                                .as_ref()
                                .and_then(|p| p.source.as_ref())
                                .and_then(|field| extract::extract_field(&html, field))
                        })
                        .await?;
                        let source = found.ok_or_else(|| {
                            binding.failure(format!("no stream URL found on {page_url}"))
                        })?;
                        absolutize(&base, &source)
                    }
                }
            }
        };

        Ok(PlayableSource {
            url,
            parse: rule.parse,
            flag,
            headers: binding.rules.headers.clone(),
        })
    }
}

fn is_absolute(id: &str) -> bool {
    id.starts_with("http://") || id.starts_with("https://")
}

fn page_base(binding: &Binding, url: &str) -> Result<Url, AppError> {
    Url::parse(url).map_err(|e| binding.failure(format!("bad page URL '{url}': {e}")))
}

/// Run HTML extraction on the blocking pool.
async fn parse<T, W>(binding: &Binding, work: W) -> Result<T, AppError>
where
    T: Send + 'static,
    W: FnOnce() -> T + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| binding.failure(format!("extraction task failed: {e}")))
}

/// Site override from the resolver config: either `{"site": "..."}` or a
/// bare URL string.
fn site_override(config: &serde_json::Value) -> Option<&str> {
    match config {
        serde_json::Value::String(site) => Some(site.as_str()),
        serde_json::Value::Object(map) => map.get("site").and_then(|v| v.as_str()),
        _ => None,
    }
}

impl<F: Fetcher + 'static> Engine for RuleEngine<F> {
    type Program = CompiledRules;

    async fn init(
        &mut self,
        key: &str,
        program: Arc<CompiledRules>,
        config: &serde_json::Value,
    ) -> Result<(), AppError> {
        let site = site_override(config)
            .unwrap_or(&program.site)
            .trim()
            .trim_end_matches('/')
            .to_string();
        let base = Url::parse(&format!("{site}/"))
            .map_err(|e| AppError::ConfigError(format!("Resolver '{key}' has bad site '{site}': {e}")))?;

        self.binding = Some(Binding {
            key: key.to_string(),
            rules: program,
            site,
            base,
        });
        Ok(())
    }

    async fn execute(&mut self, call: ResolverCall) -> Result<ResolverOutput, AppError> {
        let binding = self
            .binding
            .clone()
            .ok_or_else(|| AppError::Generic("rule engine is not bound to a resolver".into()))?;

        let output = match call {
            ResolverCall::Home { .. } => ResolverOutput::Listing(self.home(&binding).await?),
            ResolverCall::Category {
                type_id,
                page,
                filters,
                ..
            } => ResolverOutput::Listing(self.category(&binding, type_id, page, filters).await?),
            ResolverCall::Search { keyword, .. } => {
                ResolverOutput::Listing(self.search(&binding, &keyword).await?)
            }
            ResolverCall::Detail { ids } => ResolverOutput::Details(self.detail(&binding, ids).await?),
            ResolverCall::Player { flag, id, .. } => {
                ResolverOutput::Playable(self.player(&binding, flag, id).await?)
            }
        };
        Ok(output)
    }

    fn reset(&mut self) -> Result<(), AppError> {
        Ok(())
    }

    fn shutdown(&mut self) {
        self.binding = None;
    }
}

/// Creates [`RuleEngine`]s sharing one fetcher.
#[derive(Clone)]
pub struct RuleEngineFactory<F> {
    fetcher: F,
}

impl<F: Fetcher> RuleEngineFactory<F> {
    pub fn new(fetcher: F) -> Self {
        Self { fetcher }
    }
}

impl<F: Fetcher + 'static> EngineFactory for RuleEngineFactory<F> {
    type Engine = RuleEngine<F>;

    fn create(&self) -> Result<RuleEngine<F>, AppError> {
        Ok(RuleEngine::new(self.fetcher.clone()))
    }
}
