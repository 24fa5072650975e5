use thiserror::Error;

pub type Result<T> = std::result::Result<T, EtclError>;

/// File-level and configuration failures.
///
/// Row-level problems never surface here: the builder turns them into
/// `DropReason` counters on the file report.
#[derive(Error, Debug)]
pub enum EtclError {
    #[error("SourceDecodeError: {archivo} cannot be decoded (attempted: {intentadas})")]
    SourceDecode { archivo: String, intentadas: String },

    #[error("SourceStructureError: {archivo}: {detalle}")]
    SourceStructure { archivo: String, detalle: String },

    #[error("SourceSchemaError: tabla {tabla}: {detalle}")]
    SourceSchema { tabla: String, detalle: String },

    #[error("BadPeriodo: '{valor}' does not match YYYYTQ{}", at_line(.linea))]
    BadPeriodo { valor: String, linea: Option<usize> },

    #[error("ValueOutOfRange: {valor} outside [-1e6, 1e6]")]
    ValueOutOfRange { valor: f64 },

    #[error("BadValue: '{raw}' is not a Spanish-locale number")]
    BadValue { raw: String },

    #[error("UnmappedLabel: column '{columna}' has unknown label '{etiqueta}'")]
    UnmappedLabel { columna: String, etiqueta: String },

    #[error("IdentityCollision: {clave} has values {primero} (line {linea_a}) and {segundo} (line {linea_b})")]
    IdentityCollision {
        clave: String,
        primero: f64,
        segundo: f64,
        linea_a: usize,
        linea_b: usize,
    },

    #[error("Config: {0}")]
    Config(String),

    #[error("Unknown version_datos {0}")]
    UnknownVersion(i64),

    #[error("Stored row is corrupt: column {columna} = '{valor}'")]
    StoredValue { columna: String, valor: String },

    #[error("Ingestion cancelled")]
    Cancelled,

    #[error("Store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn at_line(linea: &Option<usize>) -> String {
    linea.map(|l| format!(" (line {})", l)).unwrap_or_default()
}

impl EtclError {
    /// Process exit code for the CLI: 4 for configuration, 3 for ingestion.
    pub fn exit_code(&self) -> u8 {
        match self {
            EtclError::Config(_) | EtclError::UnknownVersion(_) => 4,
            _ => 3,
        }
    }

    /// Short kind name used in the run log.
    pub fn kind(&self) -> &'static str {
        match self {
            EtclError::SourceDecode { .. } => "SourceDecodeError",
            EtclError::SourceStructure { .. } => "SourceStructureError",
            EtclError::SourceSchema { .. } => "SourceSchemaError",
            EtclError::BadPeriodo { .. } => "BadPeriodo",
            EtclError::ValueOutOfRange { .. } => "ValueOutOfRange",
            EtclError::BadValue { .. } => "BadValue",
            EtclError::UnmappedLabel { .. } => "UnmappedLabel",
            EtclError::IdentityCollision { .. } => "IdentityCollision",
            EtclError::Config(_) => "Config",
            EtclError::UnknownVersion(_) => "UnknownVersion",
            EtclError::StoredValue { .. } => "StoredValue",
            EtclError::Cancelled => "Cancelled",
            EtclError::Store(_) => "Store",
            EtclError::Json(_) => "Json",
            EtclError::Io(_) => "Io",
        }
    }
}
