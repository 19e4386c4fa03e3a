//! Allow-list validation of exported HTML documents.
//!
//! Scrubbing collects every problem in a document instead of stopping at the
//! first one, so an author can fix a whole export in a single pass.

use crate::config::Scrub;
use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Elements the HTML parser synthesizes around every document.
const SKELETON_TAGS: [&str; 3] = ["html", "head", "body"];

const META_URL_NAME: &str = "UrlName";
const META_SUMMARY: &str = "description";
const META_VISIBLE_IN_APP: &str = "is-visible-in-app";
const META_VISIBLE_IN_CSP: &str = "is-visible-in-csp";
const META_VISIBLE_IN_PKB: &str = "is-visible-in-pkb";
const META_VISIBLE_IN_PRM: &str = "is-visible-in-prm";

static META: Lazy<Selector> = Lazy::new(|| Selector::parse("meta").expect("valid selector"));
static TITLE: Lazy<Selector> = Lazy::new(|| Selector::parse("title").expect("valid selector"));
static DIV: Lazy<Selector> = Lazy::new(|| Selector::parse("div").expect("valid selector"));
static LINK: Lazy<Selector> = Lazy::new(|| Selector::parse("a[href]").expect("valid selector"));
static IMG_SRC: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(<img\b[^>]*?\ssrc=")([^"]*)(")"#).expect("valid regex"));
static SCHEME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9+.\-]*:").expect("valid regex"));

/// Every field mapped onto a knowledge base article. Comparison is exact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArticleFields {
    pub title: String,
    pub url_slug: String,
    pub summary: String,
    pub is_visible_in_app: bool,
    pub is_visible_in_csp: bool,
    pub is_visible_in_pkb: bool,
    pub is_visible_in_prm: bool,
    pub author: Option<String>,
    pub author_override: Option<String>,
    pub body: String,
}

impl ArticleFields {
    /// Copy with the image placeholder in the body replaced by `asset_base`.
    pub fn rendered(&self, placeholder: &str, asset_base: &str) -> ArticleFields {
        ArticleFields {
            body: self.body.replace(placeholder, asset_base),
            ..self.clone()
        }
    }
}

/// A document that passed scrubbing.
#[derive(Debug, Clone)]
pub struct ParsedDocument {
    /// Bundle-relative path, `/`-separated.
    pub path: String,
    /// Fields with image references still pointing at the placeholder.
    pub fields: ArticleFields,
    /// Bundle-relative paths of every image the body references.
    pub images: BTreeSet<String>,
}

impl ParsedDocument {
    /// Number of directories between the bundle root and this document.
    pub fn depth(&self) -> usize {
        self.path.matches('/').count()
    }
}

#[derive(Debug, Clone, Default)]
pub struct Scrubbed {
    /// Present only when `problems` is empty.
    pub document: Option<ParsedDocument>,
    pub problems: Vec<String>,
    /// Url slug declared by the document, even when it has problems.
    pub url_slug: Option<String>,
}

impl Scrubbed {
    pub fn is_clean(&self) -> bool {
        self.problems.is_empty()
    }
}

#[derive(Debug, Clone)]
enum UrlRule {
    Exact(String),
    Glob(Regex),
}

impl UrlRule {
    fn parse(pattern: &str) -> Result<Self> {
        if !pattern.contains(['*', '?']) {
            return Ok(UrlRule::Exact(pattern.to_string()));
        }
        Ok(UrlRule::Glob(glob_to_regex(pattern)?))
    }

    fn matches(&self, url: &str) -> bool {
        match self {
            UrlRule::Exact(s) => s == url,
            UrlRule::Glob(re) => re.is_match(url),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Scrubber {
    allowed_tags: BTreeMap<String, Vec<String>>,
    url_rules: Vec<UrlRule>,
    trusted_prefixes: Vec<String>,
    body_class: String,
    placeholder: String,
    author_meta: String,
    author_override_meta: String,
    max_links: Option<usize>,
}

impl Scrubber {
    /// `trusted_prefixes` are URL prefixes that are always allowed, typically
    /// the object store's public base URL so rendered bodies scrub clean.
    pub fn new(cfg: &Scrub, trusted_prefixes: Vec<String>) -> Result<Self> {
        let url_rules = cfg
            .allowed_urls
            .iter()
            .map(|p| UrlRule::parse(p))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            allowed_tags: cfg.allowed_tags.clone(),
            url_rules,
            trusted_prefixes,
            body_class: cfg.body_class.clone(),
            placeholder: cfg.image_placeholder.clone(),
            author_meta: cfg.author_meta.clone(),
            author_override_meta: cfg.author_override_meta.clone(),
            max_links: cfg.max_links,
        })
    }

    pub fn placeholder(&self) -> &str {
        &self.placeholder
    }

    /// Validate a whole document and extract its article fields.
    pub fn scrub(&self, html: &str, document_path: &str) -> Scrubbed {
        let mut doc = Html::parse_document(html);
        strip_comments(&mut doc);

        let mut problems: Vec<String> = self
            .markup_problems(&doc)
            .into_iter()
            .map(|p| format!("{}: {}", document_path, p))
            .collect();

        let metas: HashMap<String, String> = doc
            .select(&META)
            .filter_map(|el| {
                let name = el.value().attr("name")?;
                Some((name.to_string(), el.value().attr("content").unwrap_or("").to_string()))
            })
            .collect();

        let required = |name: &str, problems: &mut Vec<String>| -> String {
            match metas.get(name) {
                Some(v) if !v.trim().is_empty() => v.trim().to_string(),
                _ => {
                    problems.push(format!(
                        "{}: meta tag name={} not found",
                        document_path, name
                    ));
                    String::new()
                }
            }
        };
        let url_slug = required(META_URL_NAME, &mut problems);
        let summary = required(META_SUMMARY, &mut problems);
        let flag = |name: &str, problems: &mut Vec<String>| -> bool {
            let raw = required(name, problems);
            match raw.to_ascii_lowercase().as_str() {
                "true" => true,
                "false" => false,
                "" => false,
                other => {
                    problems.push(format!(
                        "{}: meta tag name={} must be true or false, got {}",
                        document_path, name, other
                    ));
                    false
                }
            }
        };
        let is_visible_in_app = flag(META_VISIBLE_IN_APP, &mut problems);
        let is_visible_in_csp = flag(META_VISIBLE_IN_CSP, &mut problems);
        let is_visible_in_pkb = flag(META_VISIBLE_IN_PKB, &mut problems);
        let is_visible_in_prm = flag(META_VISIBLE_IN_PRM, &mut problems);

        let optional = |name: &str| {
            metas
                .get(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let author = optional(&self.author_meta);
        let author_override = optional(&self.author_override_meta);

        let title = doc
            .select(&TITLE)
            .next()
            .map(|el| el.text().collect::<String>().trim().to_string())
            .unwrap_or_default();
        if title.is_empty() {
            problems.push(format!("{}: article title not found", document_path));
        }

        let body_el = doc
            .select(&DIV)
            .find(|el| el.value().classes().any(|c| c == self.body_class));
        let mut images = BTreeSet::new();
        let body = match body_el {
            Some(el) => {
                let links = el.select(&LINK).count();
                if let Some(max) = self.max_links {
                    if links > max {
                        problems.push(format!(
                            "{}: {} links exceed the limit of {}",
                            document_path, links, max
                        ));
                    }
                }
                let (body, image_problems) =
                    self.normalize_images(&el.html(), document_path, &mut images);
                problems.extend(image_problems);
                body
            }
            None => {
                problems.push(format!(
                    "{}: body tag class={} not found",
                    document_path, self.body_class
                ));
                String::new()
            }
        };

        if !problems.is_empty() {
            return Scrubbed {
                document: None,
                problems,
                url_slug: Some(url_slug).filter(|s| !s.is_empty()),
            };
        }

        Scrubbed {
            url_slug: Some(url_slug.clone()),
            document: Some(ParsedDocument {
                path: document_path.to_string(),
                fields: ArticleFields {
                    title,
                    url_slug,
                    summary,
                    is_visible_in_app,
                    is_visible_in_csp,
                    is_visible_in_pkb,
                    is_visible_in_prm,
                    author,
                    author_override,
                    body,
                },
                images,
            }),
            problems,
        }
    }

    /// Tag, attribute and URL checks on an HTML fragment such as a stored article body.
    pub fn check_markup(&self, fragment: &str) -> Vec<String> {
        let doc = Html::parse_fragment(fragment);
        self.markup_problems(&doc)
    }

    fn markup_problems(&self, doc: &Html) -> Vec<String> {
        let mut problems = Vec::new();
        for node in doc.root_element().descendants() {
            let Some(el) = ElementRef::wrap(node) else {
                continue;
            };
            let name = el.value().name();
            let Some(allowed_attrs) = self.allowed_tags.get(name) else {
                if !SKELETON_TAGS.contains(&name) {
                    problems.push(format!("tag \"{}\" not in allow-list", name));
                }
                continue;
            };
            for (attr, value) in el.value().attrs() {
                if !allowed_attrs.iter().any(|a| a == attr) {
                    problems.push(format!(
                        "tag \"{}\" attribute \"{}\" not in allow-list",
                        name, attr
                    ));
                    continue;
                }
                if (attr == "href" || attr == "src") && !self.url_allowed(value) {
                    problems.push(format!("link {} not in allow-list", value));
                }
            }
        }
        problems
    }

    fn url_allowed(&self, url: &str) -> bool {
        let url = url.trim();
        let absolute = SCHEME.is_match(url) || url.starts_with("//");
        if !absolute {
            return true;
        }
        self.trusted_prefixes.iter().any(|p| url.starts_with(p.as_str()))
            || self.url_rules.iter().any(|r| r.matches(url))
    }

    /// Rewrite every local `<img src>` in `body` to `{placeholder}{bundle path}`.
    fn normalize_images(
        &self,
        body: &str,
        document_path: &str,
        images: &mut BTreeSet<String>,
    ) -> (String, Vec<String>) {
        let doc_dir = document_path.rsplit_once('/').map(|(d, _)| d).unwrap_or("");
        let mut problems = Vec::new();
        let rewritten = IMG_SRC.replace_all(body, |caps: &Captures| {
            let raw = caps[2].replace("&amp;", "&");
            let resolved = if let Some(rest) = raw.strip_prefix(self.placeholder.as_str()) {
                resolve_relative("", rest)
            } else if SCHEME.is_match(&raw) || raw.starts_with("//") {
                return caps[0].to_string();
            } else {
                resolve_relative(doc_dir, &raw)
            };
            match resolved {
                Some(path) if !path.is_empty() => {
                    let out = format!("{}{}{}{}", &caps[1], self.placeholder, path, &caps[3]);
                    images.insert(path);
                    out
                }
                _ => {
                    problems.push(format!(
                        "{}: image {} points outside the bundle",
                        document_path, raw
                    ));
                    caps[0].to_string()
                }
            }
        });
        (rewritten.into_owned(), problems)
    }
}

fn strip_comments(doc: &mut Html) {
    let ids: Vec<_> = doc
        .tree
        .nodes()
        .filter(|n| n.value().is_comment())
        .map(|n| n.id())
        .collect();
    for id in ids {
        if let Some(mut node) = doc.tree.get_mut(id) {
            node.detach();
        }
    }
}

/// Compile a shell-style glob (`*`, `?`) into an anchored regex.
pub fn glob_to_regex(pattern: &str) -> Result<Regex> {
    let mut re = String::with_capacity(pattern.len() + 8);
    re.push('^');
    for ch in pattern.chars() {
        match ch {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            other => re.push_str(&regex::escape(&other.to_string())),
        }
    }
    re.push('$');
    Regex::new(&re).with_context(|| format!("invalid glob pattern {}", pattern))
}

/// Join `target` onto `dir`, returning `None` if it climbs above the root.
fn resolve_relative(dir: &str, target: &str) -> Option<String> {
    let target = target.split(['?', '#']).next().unwrap_or("");
    let mut parts: Vec<&str> = dir.split('/').filter(|s| !s.is_empty()).collect();
    for segment in target.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop()?;
            }
            s => parts.push(s),
        }
    }
    Some(parts.join("/"))
}
