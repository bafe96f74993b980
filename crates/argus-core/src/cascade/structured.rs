//! schema.org Product extraction from JSON-LD blocks and microdata.

use scraper::{ElementRef, Html, Selector};
use serde_json::Value;

use super::price::{normalize_currency, parse_price};
use super::{Candidate, CascadeConfig};
use crate::models::{ProductFields, Variant};

const PRODUCT_TYPES: &[&str] = &["Product", "ProductGroup"];

pub fn extract(html: &str, config: &CascadeConfig) -> Option<Candidate> {
    let document = Html::parse_document(html);
    let fields = from_json_ld(&document).or_else(|| from_microdata(&document))?;
    let penalty = config.optional_field_penalty * fields.missing_optional_count() as f64;
    let confidence = (config.structured_ceiling - penalty).max(0.0);
    Some(Candidate::new(fields, confidence))
}

/// Whether the document embeds a schema.org product with a title and a price.
pub fn has_product(document: &Html) -> bool {
    from_json_ld(document).is_some() || from_microdata(document).is_some()
}

// ---------------------------------------------------------------------------
// JSON-LD
// ---------------------------------------------------------------------------

fn from_json_ld(document: &Html) -> Option<ProductFields> {
    let selector = Selector::parse(r#"script[type="application/ld+json"]"#).ok()?;
    for script in document.select(&selector) {
        let raw = script.text().collect::<String>();
        let Ok(value) = serde_json::from_str::<Value>(raw.trim()) else {
            tracing::debug!("Skipping unparseable JSON-LD block");
            continue;
        };
        let mut products = Vec::new();
        collect_products(&value, &mut products);
        if let Some(fields) = products
            .into_iter()
            .map(product_fields)
            .find(ProductFields::has_required)
        {
            return Some(fields);
        }
    }
    None
}

fn collect_products<'a>(value: &'a Value, out: &mut Vec<&'a Value>) {
    match value {
        Value::Array(items) => items.iter().for_each(|item| collect_products(item, out)),
        Value::Object(map) => {
            if PRODUCT_TYPES.iter().any(|t| has_type(value, t)) {
                out.push(value);
            }
            if let Some(graph) = map.get("@graph") {
                collect_products(graph, out);
            }
        }
        _ => {}
    }
}

/// `@type` may be a string, a full IRI or a list of either.
fn has_type(value: &Value, name: &str) -> bool {
    let matches = |s: &str| s == name || s.rsplit('/').next() == Some(name);
    match value.get("@type") {
        Some(Value::String(s)) => matches(s.as_str()),
        Some(Value::Array(types)) => types.iter().filter_map(Value::as_str).any(matches),
        _ => false,
    }
}

fn product_fields(product: &Value) -> ProductFields {
    let offer = first_offer(product);
    let variants: Vec<Variant> = product
        .get("hasVariant")
        .map(as_list)
        .unwrap_or_default()
        .into_iter()
        .map(variant)
        .collect();

    let price = offer
        .and_then(offer_price)
        .or_else(|| variants.iter().filter_map(|v| v.price).reduce(f64::min));

    ProductFields {
        title: string_field(product, "name"),
        price,
        currency: offer
            .and_then(|o| string_field(o, "priceCurrency"))
            .and_then(|c| normalize_currency(&c)),
        original_price: offer.and_then(list_price).filter(|op| price.is_some_and(|p| *op > p)),
        availability: offer.and_then(|o| string_field(o, "availability")).map(short_iri),
        product_id: ["sku", "productID", "gtin13", "gtin", "mpn"]
            .iter()
            .find_map(|key| string_field(product, key)),
        brand: product.get("brand").and_then(name_of),
        description: string_field(product, "description"),
        images: product
            .get("image")
            .map(as_list)
            .unwrap_or_default()
            .into_iter()
            .filter_map(|img| match img {
                Value::String(s) => Some(s.clone()),
                other => string_field(other, "url").or_else(|| string_field(other, "contentUrl")),
            })
            .collect(),
        variants,
    }
}

fn variant(value: &Value) -> Variant {
    let offer = first_offer(value);
    Variant {
        name: string_field(value, "name"),
        sku: string_field(value, "sku"),
        price: offer.and_then(offer_price),
        availability: offer.and_then(|o| string_field(o, "availability")).map(short_iri),
    }
}

fn first_offer(product: &Value) -> Option<&Value> {
    product.get("offers").map(as_list)?.into_iter().next()
}

fn offer_price(offer: &Value) -> Option<f64> {
    ["price", "lowPrice"]
        .iter()
        .find_map(|key| offer.get(*key).and_then(number))
        .or_else(|| {
            offer
                .get("priceSpecification")
                .map(as_list)?
                .into_iter()
                .find(|spec| !is_list_price(spec))
                .and_then(|spec| spec.get("price").and_then(number))
        })
}

fn list_price(offer: &Value) -> Option<f64> {
    offer
        .get("priceSpecification")
        .map(as_list)?
        .into_iter()
        .find(|spec| is_list_price(spec))
        .and_then(|spec| spec.get("price").and_then(number))
}

fn is_list_price(spec: &Value) -> bool {
    spec.get("priceType")
        .and_then(Value::as_str)
        .map(short_iri)
        .is_some_and(|t| t == "ListPrice" || t == "StrikethroughPrice")
}

fn as_list(value: &Value) -> Vec<&Value> {
    match value {
        Value::Array(items) => items.iter().collect(),
        Value::Null => Vec::new(),
        other => vec![other],
    }
}

fn number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64().filter(|v| *v > 0.0),
        Value::String(s) => parse_price(s),
        _ => None,
    }
}

fn string_field(value: &Value, key: &str) -> Option<String> {
    match value.get(key)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn name_of(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Array(items) => items.iter().find_map(name_of),
        other => string_field(other, "name"),
    }
}

/// `https://schema.org/InStock` -> `InStock`.
fn short_iri(raw: impl AsRef<str>) -> String {
    let raw = raw.as_ref();
    raw.rsplit('/').next().unwrap_or(raw).to_string()
}

// ---------------------------------------------------------------------------
// Microdata
// ---------------------------------------------------------------------------

fn from_microdata(document: &Html) -> Option<ProductFields> {
    let scope = Selector::parse(r#"[itemscope][itemtype*="schema.org/Product"]"#).ok()?;
    document
        .select(&scope)
        .map(microdata_fields)
        .find(ProductFields::has_required)
}

fn microdata_fields(product: ElementRef<'_>) -> ProductFields {
    let currency = first_prop(product, "priceCurrency", false).and_then(|c| normalize_currency(&c));
    ProductFields {
        title: first_prop(product, "name", true),
        price: first_prop(product, "price", false).and_then(|p| parse_price(&p)),
        currency,
        original_price: None,
        availability: first_prop(product, "availability", false).map(short_iri),
        product_id: first_prop(product, "sku", true)
            .or_else(|| first_prop(product, "productID", true)),
        brand: brand_prop(product),
        description: first_prop(product, "description", true),
        images: props(product, "image", true)
            .filter_map(prop_value)
            .collect(),
        variants: Vec::new(),
    }
}

/// Elements carrying `itemprop=name` under `product`. With `owned`, only
/// properties whose nearest item scope is `product` itself are returned.
fn props<'a>(
    product: ElementRef<'a>,
    name: &str,
    owned: bool,
) -> impl Iterator<Item = ElementRef<'a>> {
    let selector = Selector::parse(&format!(r#"[itemprop="{name}"]"#)).ok();
    let found: Vec<ElementRef<'a>> = selector
        .map(|sel| product.select(&sel).collect())
        .unwrap_or_default();
    found.into_iter().filter(move |el| {
        !owned
            || el
                .ancestors()
                .find(|node| {
                    node.value()
                        .as_element()
                        .is_some_and(|e| e.attr("itemscope").is_some())
                })
                .map(|node| node.id())
                == Some(product.id())
    })
}

fn first_prop(product: ElementRef<'_>, name: &str, owned: bool) -> Option<String> {
    props(product, name, owned).find_map(prop_value)
}

fn prop_value(el: ElementRef<'_>) -> Option<String> {
    let attr = ["content", "href", "src"]
        .iter()
        .find_map(|a| el.value().attr(a))
        .map(str::to_string);
    let value = attr.unwrap_or_else(|| el.text().collect::<Vec<_>>().join(" "));
    let value = value.split_whitespace().collect::<Vec<_>>().join(" ");
    (!value.is_empty()).then_some(value)
}

fn brand_prop(product: ElementRef<'_>) -> Option<String> {
    let brand = props(product, "brand", true).next()?;
    if brand.value().attr("itemscope").is_some() {
        first_prop(brand, "name", true)
    } else {
        prop_value(brand)
    }
}
