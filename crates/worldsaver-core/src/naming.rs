use chrono::NaiveDateTime;

pub const TIMESTAMP_FORMAT: &str = "%Y%m%d-%H%M%S";
pub const PARTIAL_EXTENSION: &str = "partial";
pub const ARTIFACT_EXTENSIONS: &[&str] = &["mcworld", "zip"];

/// `<name>.<timestamp>.<ext>[.partial]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactName {
    pub name: String,
    pub timestamp: NaiveDateTime,
    pub extension: String,
    pub partial: bool,
}

impl ArtifactName {
    pub fn new(name: impl Into<String>, timestamp: NaiveDateTime, extension: &str) -> Self {
        Self {
            name: name.into(),
            timestamp,
            extension: extension.to_string(),
            partial: false,
        }
    }

    pub fn partial(mut self) -> Self {
        self.partial = true;
        self
    }

    pub fn file_name(&self) -> String {
        let base = format!(
            "{}.{}.{}",
            self.name,
            self.timestamp.format(TIMESTAMP_FORMAT),
            self.extension
        );
        if self.partial {
            format!("{base}.{PARTIAL_EXTENSION}")
        } else {
            base
        }
    }

    /// Returns `None` for anything that is not a backup artifact (markers, stray files).
    pub fn parse(file_name: &str) -> Option<Self> {
        if file_name.starts_with('.') {
            return None;
        }

        let (stem, partial) = match file_name.strip_suffix(&format!(".{PARTIAL_EXTENSION}")) {
            Some(stem) => (stem, true),
            None => (file_name, false),
        };

        let mut parts = stem.rsplitn(3, '.');
        let extension = parts.next()?;
        let timestamp = parts.next()?;
        let name = parts.next()?;

        if name.is_empty() || !ARTIFACT_EXTENSIONS.contains(&extension) {
            return None;
        }
        let timestamp = NaiveDateTime::parse_from_str(timestamp, TIMESTAMP_FORMAT).ok()?;

        Some(Self {
            name: name.to_string(),
            timestamp,
            extension: extension.to_string(),
            partial,
        })
    }
}

/// World artifacts carry their container so equally named worlds never share a group.
pub fn world_artifact_name(container: &str, world: &str) -> String {
    format!("{container}-{world}")
}

pub fn extras_name(container: &str) -> String {
    format!("{container}-extras")
}
