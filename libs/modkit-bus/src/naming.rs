//! Consumer display names and endpoint naming conventions.

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::BusError;

const CONSUMER_SUFFIX: &str = "Consumer";

/// Short display name of a type: last path segment, generic arguments stripped.
///
/// `app::orders::OrderHandler` becomes `OrderHandler`, `app::Batch<app::Order>` becomes `Batch`.
#[must_use]
pub fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

/// Casing applied to generated endpoint names.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NameFormatting {
    /// Keep the type's own casing (`OrderHandler`).
    #[default]
    Pascal,
    /// `order-handler`
    KebabCase,
    /// `order_handler`
    SnakeCase,
}

/// Produces endpoint names for consumers that do not set one explicitly.
pub trait EndpointNameFormatter: Send + Sync {
    /// Endpoint name for a consumer with the given short type name.
    fn consumer(&self, short_name: &str) -> String;
}

/// Formatter used when the application registers none.
///
/// Strips a trailing `Consumer` from the type name, applies the configured casing and prefixes
/// the result.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DefaultEndpointNameFormatter {
    formatting: NameFormatting,
    prefix: Option<String>,
}

impl DefaultEndpointNameFormatter {
    #[must_use]
    pub fn new(formatting: NameFormatting, prefix: Option<String>) -> Self {
        Self { formatting, prefix }
    }

    #[must_use]
    pub fn kebab_case() -> Self {
        Self::new(NameFormatting::KebabCase, None)
    }

    #[must_use]
    pub fn snake_case() -> Self {
        Self::new(NameFormatting::SnakeCase, None)
    }

    fn apply_casing(&self, name: &str) -> String {
        match self.formatting {
            NameFormatting::Pascal => name.to_owned(),
            NameFormatting::KebabCase => separate_words(name, '-'),
            NameFormatting::SnakeCase => separate_words(name, '_'),
        }
    }
}

impl EndpointNameFormatter for DefaultEndpointNameFormatter {
    fn consumer(&self, short_name: &str) -> String {
        let trimmed = match short_name.strip_suffix(CONSUMER_SUFFIX) {
            Some(rest) if !rest.is_empty() => rest,
            _ => short_name,
        };
        let cased = self.apply_casing(trimmed);
        match &self.prefix {
            Some(prefix) => format!("{prefix}{cased}"),
            None => cased,
        }
    }
}

/// Splits PascalCase into lowercase words joined by `sep`; acronyms stay together (`HTTPRequest`
/// becomes `http-request`).
fn separate_words(name: &str, sep: char) -> String {
    let chars: Vec<char> = name.chars().collect();
    let mut out = String::with_capacity(name.len() + 4);
    for (i, &c) in chars.iter().enumerate() {
        if c.is_uppercase() && i > 0 {
            let prev = chars[i - 1];
            let next_is_lower = chars.get(i + 1).is_some_and(|n| n.is_lowercase());
            let boundary = prev.is_lowercase()
                || prev.is_ascii_digit()
                || (prev.is_uppercase() && next_is_lower);
            if boundary && !out.ends_with(sep) {
                out.push(sep);
            }
        }
        out.extend(c.to_lowercase());
    }
    out
}

/// Endpoint name derived from a receive endpoint's input address: its last non-empty path
/// segment, percent-decoded.
///
/// # Errors
/// `InvalidEndpointAddress` when the address has no usable path segment.
pub fn endpoint_name_from_address(address: &Url) -> Result<String, BusError> {
    let invalid = |reason| BusError::InvalidEndpointAddress {
        address: address.to_string(),
        reason,
    };
    let segment = address
        .path_segments()
        .ok_or_else(|| invalid("address cannot be a base"))?
        .rev()
        .find(|s| !s.is_empty())
        .ok_or_else(|| invalid("address has no path segment"))?;
    urlencoding::decode(segment)
        .map(std::borrow::Cow::into_owned)
        .map_err(|_| invalid("path segment is not valid UTF-8"))
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    mod orders {
        pub struct OrderHandler;
        pub struct Batch<T>(pub T);
    }

    #[test]
    fn short_name_strips_path_and_generics() {
        assert_eq!(short_type_name::<orders::OrderHandler>(), "OrderHandler");
        assert_eq!(
            short_type_name::<orders::Batch<orders::OrderHandler>>(),
            "Batch"
        );
    }

    #[test]
    fn default_formatter_strips_consumer_suffix() {
        let f = DefaultEndpointNameFormatter::default();
        assert_eq!(f.consumer("SubmitOrderConsumer"), "SubmitOrder");
        assert_eq!(f.consumer("Consumer"), "Consumer");
        assert_eq!(f.consumer("OrderHandler"), "OrderHandler");
    }

    #[test]
    fn kebab_and_snake_casing() {
        assert_eq!(
            DefaultEndpointNameFormatter::kebab_case().consumer("SubmitOrderConsumer"),
            "submit-order"
        );
        assert_eq!(
            DefaultEndpointNameFormatter::snake_case().consumer("OrderHandler"),
            "order_handler"
        );
        assert_eq!(
            DefaultEndpointNameFormatter::kebab_case().consumer("HTTPRequestHandler"),
            "http-request-handler"
        );
        assert_eq!(
            DefaultEndpointNameFormatter::kebab_case().consumer("Order2Handler"),
            "order2-handler"
        );
    }

    #[test]
    fn prefix_is_prepended() {
        let f = DefaultEndpointNameFormatter::new(NameFormatting::KebabCase, Some("dev-".into()));
        assert_eq!(f.consumer("OrderHandler"), "dev-order-handler");
    }

    #[test]
    fn endpoint_name_uses_last_path_segment() {
        let url = Url::parse("loopback://localhost/orders/order-handler?durable=true").unwrap();
        assert_eq!(endpoint_name_from_address(&url).unwrap(), "order-handler");

        let trailing = Url::parse("loopback://localhost/order-handler/").unwrap();
        assert_eq!(endpoint_name_from_address(&trailing).unwrap(), "order-handler");
    }

    #[test]
    fn endpoint_name_is_percent_decoded() {
        let url = Url::parse("loopback://localhost/order%20handler").unwrap();
        assert_eq!(endpoint_name_from_address(&url).unwrap(), "order handler");
        let url = Url::parse("loopback://localhost/commandes-%C3%A9").unwrap();
        assert_eq!(endpoint_name_from_address(&url).unwrap(), "commandes-é");
        let url = Url::parse("loopback://localhost/bad-%FF").unwrap();
        assert!(matches!(
            endpoint_name_from_address(&url),
            Err(BusError::InvalidEndpointAddress { .. })
        ));
    }

    #[test]
    fn endpoint_name_requires_a_segment() {
        let url = Url::parse("loopback://localhost/").unwrap();
        assert!(matches!(
            endpoint_name_from_address(&url),
            Err(BusError::InvalidEndpointAddress { .. })
        ));

        let opaque = Url::parse("mailto:queue@example.com").unwrap();
        assert!(endpoint_name_from_address(&opaque).is_err());
    }
}
