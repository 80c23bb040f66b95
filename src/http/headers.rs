//! Headers, keyed by canonical name.
use std::collections::HashMap;
use std::fmt;

/// A mapping from canonical header name to an ordered, non-empty list of
/// values. A name is present exactly when it has at least one value.
#[derive(Default)]
pub struct Headers {
    map: HashMap<String, Vec<String>>,
}

impl Headers {
    pub fn new() -> Headers {
        Headers::default()
    }

    /// Canonical form: the first byte and any byte following a `-` are
    /// uppercased, everything else lowercased.
    pub fn canonicalize(name: &str) -> String {
        let mut out = String::with_capacity(name.len());
        let mut upper = true;
        for c in name.chars() {
            if upper {
                out.extend(c.to_uppercase());
            } else {
                out.extend(c.to_lowercase());
            }
            upper = c == '-';
        }
        out
    }

    /// Appends a value, keeping any existing ones.
    pub fn add(&mut self, name: &str, value: &str) {
        self.map
            .entry(Headers::canonicalize(name))
            .or_default()
            .push(value.to_owned());
    }

    /// Replaces all values for a name.
    pub fn set(&mut self, name: &str, value: &str) {
        self.map
            .insert(Headers::canonicalize(name), vec![value.to_owned()]);
    }

    /// Folds `extra` onto the last value for `name` with a single-space
    /// join. Returns false if the name has no values.
    pub fn append_value(&mut self, name: &str, extra: &str) -> bool {
        match self
            .map
            .get_mut(&Headers::canonicalize(name))
            .and_then(|values| values.last_mut())
        {
            Some(last) => {
                last.push(' ');
                last.push_str(extra);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, name: &str) -> Option<&[String]> {
        self.map
            .get(&Headers::canonicalize(name))
            .map(Vec::as_slice)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.map.contains_key(&Headers::canonicalize(name))
    }

    pub fn remove(&mut self, name: &str) -> bool {
        self.map.remove(&Headers::canonicalize(name)).is_some()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.map.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }

    /// Wire form: one `Name: v1,v2,...\r\n` line per name.
    pub fn serialize(&self) -> String {
        let mut out = String::new();
        for (name, values) in &self.map {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(&values.join(","));
            out.push_str("\r\n");
        }
        out
    }
}

impl fmt::Debug for Headers {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_map().entries(self.map.iter()).finish()
    }
}
