use std::collections::HashMap;

use super::types::ProductRecord;

const IMAGE_EXTENSIONS: &[&str] = &[".jpg", ".jpeg", ".png", ".webp", ".gif", ".svg"];

/// True when `url`, minus query string and fragment, ends in a known image
/// extension. Anything else counts as "no image", never as an error.
pub fn is_valid_image_url(url: &str) -> bool {
    let path = url
        .split(['?', '#'])
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    !path.is_empty() && IMAGE_EXTENSIONS.iter().any(|ext| path.ends_with(ext))
}

fn has_image(p: &ProductRecord) -> bool {
    p.image_url.as_deref().is_some_and(is_valid_image_url)
}

fn description_len(p: &ProductRecord) -> usize {
    p.description.as_deref().map(|d| d.chars().count()).unwrap_or(0)
}

/// Whether `challenger` should replace `incumbent` in a sku bucket.
///
/// 1. a valid image beats no image
/// 2. then the longer description wins
/// 3. exact ties keep the incumbent (first seen)
fn beats(challenger: &ProductRecord, incumbent: &ProductRecord) -> bool {
    match (has_image(challenger), has_image(incumbent)) {
        (true, false) => true,
        (false, true) => false,
        _ => description_len(challenger) > description_len(incumbent),
    }
}

/// Collapse candidates to one record per sku, in first-occurrence order.
///
/// Records without a sku each get their own bucket rather than being merged
/// into a shared one.
pub fn merge(candidates: Vec<ProductRecord>) -> Vec<ProductRecord> {
    let mut slots: Vec<ProductRecord> = Vec::with_capacity(candidates.len());
    let mut index_by_sku: HashMap<String, usize> = HashMap::new();

    for mut candidate in candidates {
        if candidate.image_url.as_deref().is_some_and(|u| !is_valid_image_url(u)) {
            candidate.image_url = None;
        }

        let sku = candidate.sku.trim();
        if sku.is_empty() {
            slots.push(candidate);
            continue;
        }

        match index_by_sku.get(sku) {
            Some(&idx) => {
                if beats(&candidate, &slots[idx]) {
                    slots[idx] = candidate;
                }
            }
            None => {
                index_by_sku.insert(sku.to_string(), slots.len());
                slots.push(candidate);
            }
        }
    }

    slots
}
