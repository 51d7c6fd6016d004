use serde::{Deserialize, Serialize};
use std::fmt;

/// The value kind a field carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    /// Free text, trimmed.
    String,
    /// A JSON number.
    Number,
    /// `true` or `false`.
    Boolean,
    /// An arbitrary JSON document.
    Json,
    /// Source code; a surrounding fenced block is stripped.
    Code,
    /// An absolute URL.
    Url,
    /// A calendar date (`YYYY-MM-DD`).
    Date,
    /// A date and time, normalized to RFC 3339 UTC.
    DateTime,
    /// One of a fixed list of options.
    Class,
}

impl FieldKind {
    /// Whether a value of this kind can only be parsed once the whole span is known.
    ///
    /// Such fields are never emitted while a stream is still in flight.
    #[must_use]
    pub const fn needs_whole_value(self) -> bool {
        matches!(self, Self::Json | Self::Code)
    }

    /// Human readable description used in prompts and corrective feedback.
    #[must_use]
    pub const fn describe(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Json => "JSON object",
            Self::Code => "code",
            Self::Url => "URL",
            Self::Date => "date (\"YYYY-MM-DD\" format)",
            Self::DateTime => "date time (\"YYYY-MM-DD HH:mm\" format, UTC unless an offset is given)",
            Self::Class => "classification class",
        }
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// Per-kind constraints checked after conversion.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Constraints {
    /// Minimum string length in characters.
    pub min_length: Option<usize>,
    /// Maximum string length in characters.
    pub max_length: Option<usize>,
    /// Regular expression a string value must match.
    pub pattern: Option<String>,
    /// Free-form format hint (e.g. `email`), rendered into prompts.
    pub format: Option<String>,
    /// Inclusive lower bound for numbers.
    pub minimum: Option<f64>,
    /// Inclusive upper bound for numbers.
    pub maximum: Option<f64>,
    /// Allowed options for class fields, in declaration order.
    pub options: Vec<String>,
}

/// The declared type of a field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldType {
    /// Scalar kind of the value (or of each item when `is_array`).
    pub kind: FieldKind,
    /// Whether the field holds a list of `kind` values.
    pub is_array: bool,
    /// Constraints checked after conversion.
    pub constraints: Constraints,
}

impl Default for FieldType {
    fn default() -> Self {
        Self {
            kind: FieldKind::String,
            is_array: false,
            constraints: Constraints::default(),
        }
    }
}

impl FieldType {
    /// Whether streaming must hold this field back until the turn is finalized.
    #[must_use]
    pub const fn is_structured(&self) -> bool {
        self.is_array || self.kind.needs_whole_value()
    }

    /// Describes the expected format, e.g. `json array of number items`.
    #[must_use]
    pub fn describe(&self) -> String {
        if self.is_array {
            format!("json array of {} items", self.kind.describe())
        } else {
            self.kind.describe().to_string()
        }
    }
}

/// A named, typed input or output slot of a signature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    /// Identifier, unique within the signature.
    pub name: String,
    /// Human readable label; the model writes `<title>:` before the value.
    pub title: String,
    /// Optional guidance rendered into the prompt.
    pub description: Option<String>,
    /// Declared type.
    pub field_type: FieldType,
    /// Whether the field may be absent.
    pub is_optional: bool,
    /// Output-only: kept during processing but never returned to callers.
    pub is_internal: bool,
}

impl Field {
    /// Creates a required string field titled from its name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let title = to_title(&name);
        Self {
            name,
            title,
            description: None,
            field_type: FieldType::default(),
            is_optional: false,
            is_internal: false,
        }
    }

    /// Creates a class field whose options come from a comma or pipe delimited list.
    ///
    /// ```
    /// use sigloop_signature::Field;
    ///
    /// let field = Field::class("sentiment", "positive, negative | neutral");
    /// assert_eq!(field.field_type.constraints.options, ["positive", "negative", "neutral"]);
    /// ```
    #[must_use]
    pub fn class(name: impl Into<String>, options: &str) -> Self {
        let mut field = Self::new(name).kind(FieldKind::Class);
        field.field_type.constraints.options = parse_class_options(options);
        field
    }

    /// Sets the value kind.
    #[must_use]
    pub const fn kind(mut self, kind: FieldKind) -> Self {
        self.field_type.kind = kind;
        self
    }

    /// Marks the field as a list of values.
    #[must_use]
    pub const fn array(mut self) -> Self {
        self.field_type.is_array = true;
        self
    }

    /// Marks the field as optional.
    #[must_use]
    pub const fn optional(mut self) -> Self {
        self.is_optional = true;
        self
    }

    /// Marks the field as internal (output only).
    #[must_use]
    pub const fn internal(mut self) -> Self {
        self.is_internal = true;
        self
    }

    /// Sets the prompt description.
    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Overrides the derived title.
    #[must_use]
    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    /// Replaces all constraints.
    #[must_use]
    pub fn constraints(mut self, constraints: Constraints) -> Self {
        self.field_type.constraints = constraints;
        self
    }

    /// Sets string length bounds.
    #[must_use]
    pub const fn length(mut self, min: Option<usize>, max: Option<usize>) -> Self {
        self.field_type.constraints.min_length = min;
        self.field_type.constraints.max_length = max;
        self
    }

    /// Sets a regular expression string values must match.
    #[must_use]
    pub fn pattern(mut self, pattern: impl Into<String>) -> Self {
        self.field_type.constraints.pattern = Some(pattern.into());
        self
    }

    /// Sets numeric bounds.
    #[must_use]
    pub const fn range(mut self, minimum: Option<f64>, maximum: Option<f64>) -> Self {
        self.field_type.constraints.minimum = minimum;
        self.field_type.constraints.maximum = maximum;
        self
    }

    /// The label that introduces this field's value in model output.
    #[must_use]
    pub fn label(&self) -> String {
        format!("{}:", self.title)
    }
}

/// Splits a comma or pipe delimited option list into trimmed, non-empty tokens.
#[must_use]
pub fn parse_class_options(options: &str) -> Vec<String> {
    options
        .split([',', '|'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}

/// Derives a title from a field name: `modelAnswer1` becomes `Model Answer 1`.
#[must_use]
pub fn to_title(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    let mut prev_digit = false;
    for ch in name.chars() {
        if ch == '_' {
            out.push(' ');
            prev_digit = false;
            continue;
        }
        let digit = ch.is_ascii_digit();
        if (ch.is_uppercase() || (digit && !prev_digit)) && !out.is_empty() {
            out.push(' ');
        }
        out.push(ch);
        prev_digit = digit;
    }

    let collapsed = out.split_whitespace().collect::<Vec<_>>().join(" ");
    let mut chars = collapsed.chars();
    chars.next().map_or_else(String::new, |first| {
        first.to_uppercase().chain(chars).collect()
    })
}
