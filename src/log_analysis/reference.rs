use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref REFERENCE_LINE: Regex =
        Regex::new(r"^Build reference: (\S+)$").expect("valid reference regex");
}

/// Picks up the `Build reference: <ref>` line a build script prints.
#[derive(Debug, Clone, Default)]
pub struct BuildReference {
    reference: Option<String>,
}

impl BuildReference {
    pub fn observe_line(&mut self, line: &str) {
        if let Some(captures) = REFERENCE_LINE.captures(line.trim()) {
            self.reference = Some(captures[1].to_string());
        }
    }

    pub fn get(&self) -> Option<&str> {
        self.reference.as_deref()
    }
}
