use std::collections::BTreeMap;

/// Identifying parameters of a read operation, kept sorted by name.
///
/// Two logically identical parameter sets produce the same cache key no matter
/// the insertion order. Empty values are dropped, so an unset filter and a
/// filter set to `""` are the same request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct QueryParams {
    params: BTreeMap<String, String>,
}

impl QueryParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        if value.is_empty() {
            self.params.remove(&name);
        } else {
            self.params.insert(name, value);
        }
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Pairs for the request query string
    pub fn pairs(&self) -> Vec<(String, String)> {
        self.params.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    /// Deterministic key: `operation?a=1&b=2`
    pub fn cache_key(&self, operation: &str) -> String {
        if self.params.is_empty() {
            return operation.to_string();
        }
        let query = self
            .params
            .iter()
            .map(|(k, v)| format!("{}={}", escape(k), escape(v)))
            .collect::<Vec<_>>()
            .join("&");
        format!("{}?{}", operation, query)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for QueryParams {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut params = Self::new();
        for (k, v) in iter {
            params.insert(k, v);
        }
        params
    }
}

/// Escape the key separators so distinct parameter sets cannot collide
fn escape(s: &str) -> String {
    s.replace('%', "%25").replace('&', "%26").replace('=', "%3D")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_is_order_independent() {
        let a: QueryParams = [("subject", "math"), ("class", "10A")].into_iter().collect();
        let b: QueryParams = [("class", "10A"), ("subject", "math")].into_iter().collect();
        assert_eq!(a.cache_key("stats"), b.cache_key("stats"));
        assert_eq!(a.cache_key("stats"), "stats?class=10A&subject=math");
    }

    #[test]
    fn test_empty_values_are_dropped() {
        let params = QueryParams::new()
            .with("class", "10A")
            .with("start_date", "")
            .with("end_date", "");
        assert_eq!(params.cache_key("stats"), "stats?class=10A");

        // Clearing a filter removes it
        let params = params.with("class", "");
        assert!(params.is_empty());
        assert_eq!(params.cache_key("stats"), "stats");
    }

    #[test]
    fn test_separators_are_escaped() {
        let tricky = QueryParams::new().with("q", "a&b=c");
        let split = QueryParams::new().with("q", "a").with("b", "c");
        assert_ne!(tricky.cache_key("search"), split.cache_key("search"));
        assert_eq!(tricky.cache_key("search"), "search?q=a%26b%3Dc");
    }

    #[test]
    fn test_different_operations_do_not_collide() {
        let params = QueryParams::new().with("student_id", "7");
        assert_ne!(params.cache_key("summary"), params.cache_key("rankings"));
        assert_eq!(params.get("student_id"), Some("7"));
    }
}
