//! Field mini-language, URL templates and HTML extraction.
//!
//! A field is written as one of:
//!
//! - `"css"`: trimmed text of the first element matching `css`
//! - `"css@attr"`: attribute `attr` of the first element matching `css`
//! - `"@attr"`: attribute `attr` of the context element
//! - `""` or `"."`: text of the context element
//!
//! Everything here is synchronous and runs on the blocking pool.

use std::collections::BTreeMap;

use arachne_core::models::{DetailRecord, Episode, Playlist, VodItem};
use scraper::{ElementRef, Html, Selector};
use url::Url;

pub(crate) fn selector(raw: &str) -> Result<Selector, String> {
    Selector::parse(raw).map_err(|e| format!("invalid selector '{raw}': {e}"))
}

/// A compiled field expression.
#[derive(Debug, Clone)]
pub struct Field {
    selector: Option<Selector>,
    attr: Option<String>,
}

impl Field {
    pub fn parse(raw: &str) -> Result<Self, String> {
        let raw = raw.trim();
        let (css, attr) = match raw.rsplit_once('@') {
            Some((css, attr)) if is_attr_name(attr) => (css.trim(), Some(attr.to_string())),
            _ => (raw, None),
        };
        let selector = match css {
            "" | "." => None,
            css => Some(selector(css)?),
        };
        Ok(Self { selector, attr })
    }

    /// Evaluate against `context`. Empty results are `None`.
    pub fn extract(&self, context: ElementRef<'_>) -> Option<String> {
        let target = match &self.selector {
            Some(selector) => context.select(selector).next()?,
            None => context,
        };
        let value = match &self.attr {
            Some(attr) => target.value().attr(attr)?.trim().to_string(),
            None => element_text(target),
        };
        (!value.is_empty()).then_some(value)
    }
}

fn is_attr_name(s: &str) -> bool {
    !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | ':'))
}

/// Text content with runs of whitespace collapsed to single spaces.
pub fn element_text(element: ElementRef<'_>) -> String {
    element
        .text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

// ---------------------------------------------------------------------------
// Templates
// ---------------------------------------------------------------------------

/// Substitute `{name}` placeholders from `vars`. Unknown placeholders
/// render as empty strings; unbalanced braces are copied through.
pub fn render(template: &str, vars: &BTreeMap<String, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        match after.find('}') {
            Some(close) if is_placeholder(&after[..close]) => {
                if let Some(value) = vars.get(&after[..close]) {
                    out.push_str(value);
                }
                rest = &after[close + 1..];
            }
            _ => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

fn is_placeholder(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Percent-encode a query value.
pub fn encode(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

/// Resolve `href` against `base`; returns `href` unchanged if it cannot be
/// joined.
pub fn absolutize(base: &Url, href: &str) -> String {
    base.join(href)
        .map(|u| u.to_string())
        .unwrap_or_else(|_| href.to_string())
}

// ---------------------------------------------------------------------------
// Extraction
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ListSelectors {
    pub list: Selector,
    pub id: Field,
    pub name: Field,
    pub pic: Option<Field>,
    pub remark: Option<Field>,
}

/// Extract listing items. Entries without an id or a name are skipped.
pub fn extract_items(html: &str, rules: &ListSelectors, base: &Url) -> Vec<VodItem> {
    let document = Html::parse_document(html);
    document
        .select(&rules.list)
        .filter_map(|entry| {
            let id = rules.id.extract(entry)?;
            let name = rules.name.extract(entry)?;
            let field = |f: &Option<Field>| f.as_ref().and_then(|f| f.extract(entry));
            Some(VodItem {
                id,
                name,
                pic: field(&rules.pic)
                    .map(|p| absolutize(base, &p))
                    .unwrap_or_default(),
                remark: field(&rules.remark).unwrap_or_default(),
            })
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct DetailSelectors {
    pub name: Field,
    pub pic: Option<Field>,
    pub description: Option<Field>,
    pub year: Option<Field>,
    pub area: Option<Field>,
    pub actors: Option<Field>,
    pub director: Option<Field>,
    pub playlists: Option<PlaylistSelectors>,
}

/// Flags and episode groups are paired by position.
#[derive(Debug, Clone)]
pub struct PlaylistSelectors {
    pub flags: Selector,
    pub groups: Selector,
    pub episode: Selector,
    pub episode_name: Field,
    pub episode_id: Field,
}

pub fn extract_detail(html: &str, rules: &DetailSelectors, id: &str, base: &Url) -> DetailRecord {
    let document = Html::parse_document(html);
    let root = document.root_element();
    let field = |f: &Option<Field>| f.as_ref().and_then(|f| f.extract(root));

    DetailRecord {
        id: id.to_string(),
        name: rules.name.extract(root).unwrap_or_default(),
        pic: field(&rules.pic)
            .map(|p| absolutize(base, &p))
            .unwrap_or_default(),
        description: field(&rules.description).unwrap_or_default(),
        year: field(&rules.year),
        area: field(&rules.area),
        actors: field(&rules.actors),
        director: field(&rules.director),
        playlists: rules
            .playlists
            .as_ref()
            .map(|p| extract_playlists(root, p))
            .unwrap_or_default(),
    }
}

fn extract_playlists(root: ElementRef<'_>, rules: &PlaylistSelectors) -> Vec<Playlist> {
    let flags: Vec<String> = root.select(&rules.flags).map(element_text).collect();
    root.select(&rules.groups)
        .enumerate()
        .filter_map(|(i, group)| {
            let episodes: Vec<Episode> = group
                .select(&rules.episode)
                .filter_map(|ep| {
                    Some(Episode {
                        name: rules.episode_name.extract(ep)?,
                        id: rules.episode_id.extract(ep)?,
                    })
                })
                .collect();
            if episodes.is_empty() {
                return None;
            }
            let flag = flags
                .get(i)
                .filter(|f| !f.is_empty())
                .cloned()
                .unwrap_or_else(|| format!("line{}", i + 1));
            Some(Playlist { flag, episodes })
        })
        .collect()
}

/// Evaluate a single field against a whole page.
pub fn extract_field(html: &str, field: &Field) -> Option<String> {
    let document = Html::parse_document(html);
    field.extract(document.root_element())
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIST_HTML: &str = r#"
        <ul>
          <li class="vod"><a href="/v/1" title="First">First  Film</a><img data-src="/img/1.jpg"><span>HD</span></li>
          <li class="vod"><a href="/v/2" title="Second">Second</a></li>
          <li class="vod"><span>no link</span></li>
        </ul>"#;

    fn vars(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_field_forms() {
        let html = Html::parse_fragment(r#"<div id="x" data-k="v"><a href="/p"> Hello   world </a></div>"#);
        let div = html.select(&selector("#x").unwrap()).next().unwrap();

        assert_eq!(Field::parse("a").unwrap().extract(div).as_deref(), Some("Hello world"));
        assert_eq!(Field::parse("a@href").unwrap().extract(div).as_deref(), Some("/p"));
        assert_eq!(Field::parse("@data-k").unwrap().extract(div).as_deref(), Some("v"));
        assert_eq!(Field::parse(".").unwrap().extract(div).as_deref(), Some("Hello world"));
        assert_eq!(Field::parse("span").unwrap().extract(div), None);
        assert!(Field::parse("a[").is_err());
    }

    #[test]
    fn test_render_placeholders() {
        let v = vars(&[("site", "https://s.example"), ("tid", "2"), ("page", "3")]);
        assert_eq!(
            render("{site}/list/{tid}-{page}.html?area={area}", &v),
            "https://s.example/list/2-3.html?area="
        );
        assert_eq!(render("{site}/{ not a var }", &v), "https://s.example/{ not a var }");
        assert_eq!(render("trailing {", &v), "trailing {");
    }

    #[test]
    fn test_encode_keyword() {
        assert_eq!(encode("流浪 地球"), "%E6%B5%81%E6%B5%AA+%E5%9C%B0%E7%90%83");
    }

    #[test]
    fn test_extract_items_skips_incomplete_entries() {
        let rules = ListSelectors {
            list: selector("li.vod").unwrap(),
            id: Field::parse("a@href").unwrap(),
            name: Field::parse("a").unwrap(),
            pic: Some(Field::parse("img@data-src").unwrap()),
            remark: Some(Field::parse("span").unwrap()),
        };
        let base = Url::parse("https://s.example/list/1").unwrap();
        let items = extract_items(LIST_HTML, &rules, &base);

        assert_eq!(items.len(), 2);
        assert_eq!(items[0].id, "/v/1");
        assert_eq!(items[0].name, "First Film");
        assert_eq!(items[0].pic, "https://s.example/img/1.jpg");
        assert_eq!(items[0].remark, "HD");
        assert_eq!(items[1].pic, "");
    }

    #[test]
    fn test_extract_detail_pairs_flags_with_groups() {
        let html = r#"
            <h1>Title</h1><p class="desc"> Long  story </p>
            <div class="tabs"><span>Line A</span><span>Line B</span></div>
            <ul class="eps"><li><a href="/play/1-1">EP1</a></li><li><a href="/play/1-2">EP2</a></li></ul>
            <ul class="eps"><li><a href="/play/2-1">EP1</a></li></ul>"#;
        let rules = DetailSelectors {
            name: Field::parse("h1").unwrap(),
            pic: None,
            description: Some(Field::parse("p.desc").unwrap()),
            year: None,
            area: None,
            actors: None,
            director: None,
            playlists: Some(PlaylistSelectors {
                flags: selector(".tabs span").unwrap(),
                groups: selector("ul.eps").unwrap(),
                episode: selector("li a").unwrap(),
                episode_name: Field::parse(".").unwrap(),
                episode_id: Field::parse("@href").unwrap(),
            }),
        };
        let base = Url::parse("https://s.example/").unwrap();
        let record = extract_detail(html, &rules, "/v/1", &base);

        assert_eq!(record.name, "Title");
        assert_eq!(record.description, "Long story");
        assert_eq!(record.playlists.len(), 2);
        assert_eq!(record.playlists[0].flag, "Line A");
        assert_eq!(record.playlists[0].episodes[1].id, "/play/1-2");
        assert_eq!(record.playlists[1].flag, "Line B");
    }

    #[test]
    fn test_absolutize_keeps_unjoinable() {
        let base = Url::parse("https://s.example/a/b").unwrap();
        assert_eq!(absolutize(&base, "c.jpg"), "https://s.example/a/c.jpg");
        assert_eq!(absolutize(&base, "https://cdn.example/x"), "https://cdn.example/x");
    }
}
