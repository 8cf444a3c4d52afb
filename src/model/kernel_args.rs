use std::collections::HashMap;

/// An ordered collection of kernel boot parameters.
///
/// `key=value` yields `Some(value)`, `key=` yields `Some("")` and a bare
/// `key` yields `None`. First-insertion order is preserved so that
/// serializing a parsed command line reproduces it byte for byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelArgs {
    keys: Vec<String>,
    map: HashMap<String, Option<String>>,
}

impl KernelArgs {
    pub fn new() -> Self {
        Self {
            keys: Vec::new(),
            map: HashMap::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Option<String>> {
        self.map.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.map.contains_key(key)
    }

    /// Inserts a parameter, appending it to the serialization order if the
    /// key is new and updating the value in place otherwise.
    pub fn insert(&mut self, key: impl Into<String>, value: Option<String>) {
        let key = key.into();
        if self.map.insert(key.clone(), value).is_none() {
            self.keys.push(key);
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<Option<String>> {
        let removed = self.map.remove(key);
        if removed.is_some() {
            self.keys.retain(|k| k != key);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl ToString for KernelArgs {
    fn to_string(&self) -> String {
        let mut fields: Vec<String> = Vec::with_capacity(self.keys.len());
        for key in &self.keys {
            let mut field = key.to_owned();
            if let Some(s) = self.map.get(key).and_then(|v| v.as_ref()) {
                field.push_str("=");
                field += s;
            }
            fields.push(field);
        }
        fields.join(" ")
    }
}

impl From<String> for KernelArgs {
    fn from(raw_string: String) -> Self {
        let mut args = KernelArgs::new();
        raw_string.split_ascii_whitespace().for_each(|kv_pair| {
            if let Some((key, value)) = kv_pair.split_once("=") {
                args.insert(key, Some(value.into()));
            } else {
                args.insert(kv_pair, None);
            }
        });

        args
    }
}

impl From<&str> for KernelArgs {
    fn from(raw_string: &str) -> Self {
        Self::from(raw_string.to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kernel_args_parse() {
        let args = KernelArgs::from("foo=bar blah doo=a=silly=val huh= bleh duh= boo=far");
        assert_eq!(args.get("foo"), Some(&Some("bar".to_string())));
        assert_eq!(args.get("blah"), Some(&None));
        assert_eq!(args.get("doo"), Some(&Some("a=silly=val".to_string())));
        assert_eq!(args.get("huh"), Some(&Some("".to_string())));
        assert_eq!(args.get("bleh"), Some(&None));
        assert_eq!(args.get("duh"), Some(&Some("".to_string())));
        assert_eq!(args.get("boo"), Some(&Some("far".to_string())));
        assert_eq!(args.get("nothing"), None);
    }

    #[test]
    fn test_kernel_args_round_trip() {
        let raw = "foo=bar blah doo=a=silly=val huh= bleh duh= boo=far";
        let args = KernelArgs::from(raw);
        assert_eq!(args.to_string(), raw);
        assert_eq!(KernelArgs::from(args.to_string()), args);
    }

    #[test]
    fn test_kernel_args_remove_preserves_order() {
        let mut args = KernelArgs::from("ro console=ttyS0 reboot=k");
        args.remove("console");
        assert_eq!(args.to_string(), "ro reboot=k");
        args.insert("console", Some("ttyS1".to_string()));
        assert_eq!(args.to_string(), "ro reboot=k console=ttyS1");
    }

    #[test]
    fn test_kernel_args_insert_updates_in_place() {
        let mut args = KernelArgs::from("a=1 b=2 c=3");
        args.insert("b", Some("9".to_string()));
        assert_eq!(args.to_string(), "a=1 b=9 c=3");
    }
}
