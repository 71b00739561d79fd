pub type Error = IceboxError;
pub type Result<T> = std::result::Result<T, Error>;

/// Creates an `IceboxError` variant with the source location injected.
///
/// `icebox_error!(SourceNotFound { name: name.to_string() })`
#[macro_export]
macro_rules! icebox_error {
    ($variant:ident { $($field:ident : $value:expr),* $(,)? }) => {{
        $crate::IceboxError::$variant {
            $($field: $value,)*
            meta: $crate::ErrorMeta::new($crate::ErrorLocation::new(file!(), line!())),
        }
    }};
    ($variant:ident) => {{
        $crate::IceboxError::$variant {
            meta: $crate::ErrorMeta::new($crate::ErrorLocation::new(file!(), line!())),
        }
    }};
}

#[derive(Debug, Clone, Copy)]
pub struct ErrorLocation {
    file: &'static str,
    line: u32,
}

impl ErrorLocation {
    pub const fn new(file: &'static str, line: u32) -> Self {
        Self { file, line }
    }
}

impl Default for ErrorLocation {
    fn default() -> Self {
        Self {
            file: "<unknown>",
            line: 0,
        }
    }
}

impl std::fmt::Display for ErrorLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

#[derive(Debug, Clone)]
pub struct ErrorMeta {
    pub location: ErrorLocation,
    pub contexts: Vec<(String, ErrorLocation)>,
}

impl ErrorMeta {
    pub fn new(location: ErrorLocation) -> Self {
        Self {
            location,
            contexts: Vec::new(),
        }
    }
}

impl Default for ErrorMeta {
    #[track_caller]
    fn default() -> Self {
        let location = std::panic::Location::caller();
        Self::new(ErrorLocation::new(location.file(), location.line()))
    }
}

impl std::fmt::Display for ErrorMeta {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if f.alternate() {
            return write!(f, "(at {})", self.location);
        }
        if self.contexts.is_empty() {
            return Ok(());
        }
        let mut iter = self.contexts.iter().rev();
        if let Some(context) = iter.next() {
            write!(f, "{} (at {})", context.0, context.1)?;
        }
        for context in iter {
            write!(f, "\n  - caused by: {} (at {})", context.0, context.1)?;
        }
        write!(f, "\n  - caused by: ")?;
        Ok(())
    }
}

/// Broad classification of failures, so callers can tell a retryable
/// transport problem apart from a fatal integrity or consistency problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Checked before any remote call: missing/duplicate box or source.
    Precondition,
    /// Raised by a backend; in-flight jobs stay persisted for a retry.
    Transport,
    /// Content hash or authentication mismatch while decrypting.
    Integrity,
    /// Local catalog format does not match this version.
    Consistency,
    /// Invalid configuration or per-call options.
    Configuration,
    /// Local filesystem or catalog failure.
    Local,
}

/// Generates the central IceboxError enum together with its kind mapping.
macro_rules! icebox_error_variants {
    ($( $variant:ident [$kind:ident] { $( $(#[$field_attr:meta])* $field:ident : $ty:ty ),* $(,)? } => $message:expr ),* $(,)?) => {
        #[derive(thiserror::Error, Debug)]
        pub enum IceboxError {
            $(
                #[error($message)]
                $variant {
                    $( $(#[$field_attr])* $field: $ty, )*
                },
            )*
        }

        impl IceboxError {
            fn contexts_mut(&mut self) -> &mut Vec<(String, ErrorLocation)> {
                match self {
                    $( IceboxError::$variant { meta, .. } => &mut meta.contexts, )*
                }
            }

            pub fn kind(&self) -> ErrorKind {
                match self {
                    $( IceboxError::$variant { .. } => ErrorKind::$kind, )*
                }
            }
        }
    };
}

icebox_error_variants! {
    BoxNotFound [Precondition] {
        path: String,
        meta: ErrorMeta,
    } => "{meta}Box not found: {path} {meta:#}",
    BoxExists [Precondition] {
        path: String,
        meta: ErrorMeta,
    } => "{meta}Box already exists: {path} {meta:#}",
    SourceExists [Precondition] {
        name: String,
        meta: ErrorMeta,
    } => "{meta}Source already exists in box: {name} {meta:#}",
    SourceNotFound [Precondition] {
        name: String,
        meta: ErrorMeta,
    } => "{meta}Source not found in box: {name} {meta:#}",
    DestinationExists [Precondition] {
        path: String,
        meta: ErrorMeta,
    } => "{meta}Destination already exists: {path} {meta:#}",
    JobExists [Consistency] {
        operation: String,
        meta: ErrorMeta,
    } => "{meta}A job is already recorded for {operation} {meta:#}",
    BackendError [Transport] {
        description: String,
        meta: ErrorMeta,
    } => "{meta}Backend error: {description} {meta:#}",
    JobFailed [Transport] {
        operation: String,
        meta: ErrorMeta,
    } => "{meta}Backend job failed: {operation} {meta:#}",
    IntegrityError [Integrity] {
        description: String,
        meta: ErrorMeta,
    } => "{meta}Integrity check failed: {description} {meta:#}",
    CryptoError [Integrity] {
        description: String,
        meta: ErrorMeta,
    } => "{meta}Cryptography error: {description} {meta:#}",
    SchemaMismatch [Consistency] {
        found: String,
        expected: String,
        meta: ErrorMeta,
    } => "{meta}Unsupported catalog schema version {found} (expected {expected}) {meta:#}",
    InvalidParameter [Configuration] {
        description: String,
        meta: ErrorMeta,
    } => "{meta}Invalid parameter error: {description} {meta:#}",
    ConfigError [Configuration] {
        description: String,
        meta: ErrorMeta,
    } => "{meta}Configuration error: {description} {meta:#}",
    IoError [Local] {
        #[source]
        source: std::io::Error,
        meta: ErrorMeta,
    } => "{meta}I/O error: {source} {meta:#}",
    CatalogError [Local] {
        #[source]
        source: rusqlite::Error,
        meta: ErrorMeta,
    } => "{meta}Catalog error: {source} {meta:#}",
    HttpError [Transport] {
        #[source]
        source: reqwest::Error,
        meta: ErrorMeta,
    } => "{meta}HTTP error: {source} {meta:#}",
}

/// Internal helper to conditionally convert a field value.
macro_rules! icebox_error_from_value {
    ($field:ident) => {
        $field
    };
    ($field:ident, $into:ty) => {
        $field.into()
    };
}

/// Implements From<ExternalError> for IceboxError.
macro_rules! icebox_error_from {
    ($( #[from] $variant:ident ( $field:ident : $ty:ty $(=> $into:ty)? ) ),* $(,)?) => {
        $(
            impl From<$ty> for IceboxError {
                #[track_caller]
                fn from($field: $ty) -> Self {
                    let location = std::panic::Location::caller();
                    IceboxError::$variant {
                        $field: icebox_error_from_value!($field $(, $into)?),
                        meta: ErrorMeta::new(ErrorLocation::new(location.file(), location.line())),
                    }
                }
            }
        )*
    };
}

icebox_error_from! {
    #[from] IoError(source: std::io::Error),
    #[from] CatalogError(source: rusqlite::Error),
    #[from] HttpError(source: reqwest::Error),
}

/// Implements From<ExternalError> for errors that only carry a description.
macro_rules! icebox_error_from_description {
    ($( $ty:ty => $variant:ident ),* $(,)?) => {
        $(
            impl From<$ty> for IceboxError {
                #[track_caller]
                fn from(source: $ty) -> Self {
                    let location = std::panic::Location::caller();
                    IceboxError::$variant {
                        description: source.to_string(),
                        meta: ErrorMeta::new(ErrorLocation::new(location.file(), location.line())),
                    }
                }
            }
        )*
    };
}

icebox_error_from_description! {
    serde_yaml::Error => ConfigError,
    serde_json::Error => BackendError,
    quick_xml::Error => BackendError,
}

impl IceboxError {
    #[track_caller]
    pub fn context(self, message: impl Into<String>) -> Self {
        let location = std::panic::Location::caller();
        self.context_at(message, location)
    }

    pub fn context_at(
        mut self,
        message: impl Into<String>,
        location: &'static std::panic::Location<'static>,
    ) -> Self {
        self.contexts_mut().push((
            message.into(),
            ErrorLocation::new(location.file(), location.line()),
        ));
        self
    }
}

/// Extension trait to add context to Results.
pub trait ResultExt<T> {
    fn context(self, message: impl Into<String>) -> Result<T>;
}

impl<T, E> ResultExt<T> for std::result::Result<T, E>
where
    E: Into<IceboxError>,
{
    #[track_caller]
    fn context(self, message: impl Into<String>) -> Result<T> {
        let location = std::panic::Location::caller();
        self.map_err(|e| e.into().context_at(message, location))
    }
}
