//! Product references embedded in reply prose, and the cleanup pass that
//! strips them before display.

use std::sync::LazyLock;

use regex::{Captures, Regex};

use super::products::is_valid_image_url;
use super::types::ProductRecord;

static DELIMITED_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)\[\[PRODUCT\]\](.*?)\[\[/PRODUCT\]\]").expect("valid delimited block regex")
});

static INLINE_OBJECT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\{\{\s*product\b([^}]*)\}\}").expect("valid inline object regex")
});

static PRODUCT_LINK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[([^\]\n]+)\]\(([^)\s]*/product[^)\s]*)\)").expect("valid product link regex")
});

static IFRAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<iframe\b([^>]*)>(?:\s*</iframe>)?").expect("valid iframe regex")
});

static PRODUCT_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<product\b([^>]*)>(.*?)</product>").expect("valid product tag regex")
});

static ATTRIBUTE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"([A-Za-z_][\w-]*)\s*=\s*(?:"([^"]*)"|'([^']*)')"#).expect("valid attribute regex")
});

static ANY_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<[^<>\n]+>").expect("valid tag regex"));

static EXCESS_NEWLINES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n{3,}").expect("valid newline regex"));

/// Every product reference found in `text`, in order of appearance.
///
/// References that do not parse are skipped. Records carry no description.
pub fn extract_product_refs(text: &str) -> Vec<ProductRecord> {
    let mut found: Vec<(usize, ProductRecord)> = Vec::new();

    for caps in DELIMITED_BLOCK.captures_iter(text) {
        let Some(body) = caps.get(1) else { continue };
        let parsed = serde_json::from_str::<serde_json::Value>(body.as_str().trim())
            .ok()
            .and_then(|v| ProductRecord::from_value(&v));
        match parsed {
            Some(mut record) => {
                record.description = None;
                found.push((span_start(&caps), record));
            }
            None => tracing::debug!("Skipping unparseable product block"),
        }
    }

    for caps in INLINE_OBJECT.captures_iter(text) {
        let attrs = attributes(caps.get(1).map_or("", |m| m.as_str()));
        if let Some(record) = record_from_attrs(&attrs, None) {
            found.push((span_start(&caps), record));
        }
    }

    for caps in PRODUCT_LINK.captures_iter(text) {
        let label = caps.get(1).map_or("", |m| m.as_str()).trim();
        let href = caps.get(2).map_or("", |m| m.as_str());
        let params = query_params(href);
        let sku = param(&params, &["sku"]);
        let pid = param(&params, &["pid", "productId", "product_id"]);
        if sku.is_none() && pid.is_none() {
            continue;
        }
        found.push((
            span_start(&caps),
            ProductRecord {
                sku: sku.unwrap_or_default(),
                product_id: pid.unwrap_or_default(),
                title: label.to_string(),
                image_url: None,
                description: None,
                url: href.to_string(),
            },
        ));
    }

    for caps in IFRAME.captures_iter(text) {
        let attrs = attributes(caps.get(1).map_or("", |m| m.as_str()));
        let Some(src) = attr(&attrs, &["src"]) else { continue };
        let params = query_params(&src);
        let sku = param(&params, &["sku"]);
        let pid = param(&params, &["pid", "productId", "product_id"]);
        if sku.is_none() && pid.is_none() {
            continue;
        }
        found.push((
            span_start(&caps),
            ProductRecord {
                sku: sku.unwrap_or_default(),
                product_id: pid.unwrap_or_default(),
                title: attr(&attrs, &["title"])
                    .or_else(|| param(&params, &["title"]))
                    .unwrap_or_default(),
                image_url: param(&params, &["image", "imageUrl"])
                    .filter(|u| is_valid_image_url(u)),
                description: None,
                url: src,
            },
        ));
    }

    for caps in PRODUCT_TAG.captures_iter(text) {
        let attrs = attributes(caps.get(1).map_or("", |m| m.as_str()));
        let inner = caps.get(2).map_or("", |m| m.as_str()).trim();
        if let Some(record) = record_from_attrs(&attrs, Some(inner)) {
            found.push((span_start(&caps), record));
        }
    }

    found.sort_by_key(|(pos, _)| *pos);
    found.into_iter().map(|(_, record)| record).collect()
}

/// Strip product markup and stray tags from display text.
///
/// Product links collapse to their label; runs of three or more newlines
/// collapse to two.
pub fn clean_text(text: &str) -> String {
    let text = DELIMITED_BLOCK.replace_all(text, "");
    let text = INLINE_OBJECT.replace_all(&text, "");
    let text = IFRAME.replace_all(&text, "");
    let text = PRODUCT_TAG.replace_all(&text, "");
    let text = PRODUCT_LINK.replace_all(&text, "$1");
    let text = ANY_TAG.replace_all(&text, "");
    let text = text.replace("\r\n", "\n");
    EXCESS_NEWLINES.replace_all(&text, "\n\n").trim().to_string()
}

fn span_start(caps: &Captures<'_>) -> usize {
    caps.get(0).map_or(0, |m| m.start())
}

fn attributes(raw: &str) -> Vec<(String, String)> {
    ATTRIBUTE
        .captures_iter(raw)
        .filter_map(|c| {
            let name = c.get(1)?.as_str().to_ascii_lowercase();
            let value = c.get(2).or_else(|| c.get(3))?.as_str().trim().to_string();
            Some((name, value))
        })
        .collect()
}

fn attr(attrs: &[(String, String)], names: &[&str]) -> Option<String> {
    names.iter().find_map(|name| {
        attrs
            .iter()
            .find(|(k, v)| k.eq_ignore_ascii_case(name) && !v.is_empty())
            .map(|(_, v)| v.clone())
    })
}

fn record_from_attrs(attrs: &[(String, String)], inner_title: Option<&str>) -> Option<ProductRecord> {
    let sku = attr(attrs, &["sku"]).unwrap_or_default();
    let product_id = attr(attrs, &["pid", "productid", "product_id", "id"]).unwrap_or_default();
    let title = inner_title
        .filter(|t| !t.is_empty())
        .map(|t| ANY_TAG.replace_all(t, "").trim().to_string())
        .or_else(|| attr(attrs, &["title", "name"]))
        .unwrap_or_default();
    if sku.is_empty() && product_id.is_empty() && title.is_empty() {
        return None;
    }
    Some(ProductRecord {
        sku,
        product_id,
        title,
        image_url: attr(attrs, &["image", "imageurl", "image_url"]).filter(|u| is_valid_image_url(u)),
        description: None,
        url: attr(attrs, &["url", "href", "link"]).unwrap_or_default(),
    })
}

fn query_params(href: &str) -> Vec<(String, String)> {
    let Some((_, query)) = href.split_once('?') else {
        return Vec::new();
    };
    let query = query.split('#').next().unwrap_or_default();
    url::form_urlencoded::parse(query.as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
}

fn param(params: &[(String, String)], names: &[&str]) -> Option<String> {
    names.iter().find_map(|name| {
        params
            .iter()
            .find(|(k, v)| k == name && !v.trim().is_empty())
            .map(|(_, v)| v.trim().to_string())
    })
}
