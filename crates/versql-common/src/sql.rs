use serde::{Deserialize, Serialize, Serializer};
use std::fmt;

/// Scalar bound to a `?` placeholder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "NULL"),
            Self::Integer(v) => write!(f, "{v}"),
            Self::Real(v) => write!(f, "{v}"),
            Self::Text(v) => write!(f, "{v}"),
            Self::Blob(v) => write!(f, "<{} bytes>", v.len()),
        }
    }
}

macro_rules! impl_value_from {
    ($variant:ident, $target:ty, $($t:ty),+) => {
        $(
            impl From<$t> for Value {
                fn from(v: $t) -> Self {
                    Self::$variant(<$target>::from(v))
                }
            }
        )+
    };
}

impl_value_from!(Integer, i64, i8, i16, i32, i64, u8, u16, u32);
impl_value_from!(Real, f64, f32, f64);
impl_value_from!(Text, String, String, &str);
impl_value_from!(Blob, Vec<u8>, Vec<u8>, &[u8]);

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Integer(i64::from(v))
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

/// One canonical unit: a statement and the parameters bound to it, in order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Statement {
    pub sql: String,
    #[serde(default)]
    pub params: Vec<Value>,
}

impl Statement {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    pub fn with_params<I, V>(sql: impl Into<String>, params: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Self {
            sql: sql.into(),
            params: params.into_iter().map(Into::into).collect(),
        }
    }

    pub fn bind(mut self, value: impl Into<Value>) -> Self {
        self.params.push(value.into());
        self
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let params: Vec<String> = self.params.iter().map(ToString::to_string).collect();
        write!(f, "{} with ({})", self.sql, params.join(","))
    }
}

/// SQL accepted by every execution entry point.
///
/// The caller picks the shape explicitly, so a one-element `Batch` is still
/// treated as a batch (insert results come back as a list, for example).
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(from = "RawInput")]
pub enum SqlInput {
    Statement(String),
    Parameterized(Statement),
    Batch(Vec<Statement>),
}

impl SqlInput {
    pub fn is_batch(&self) -> bool {
        matches!(self, Self::Batch(_))
    }
}

impl From<&str> for SqlInput {
    fn from(sql: &str) -> Self {
        Self::Statement(sql.to_string())
    }
}

impl From<String> for SqlInput {
    fn from(sql: String) -> Self {
        Self::Statement(sql)
    }
}

impl From<Statement> for SqlInput {
    fn from(statement: Statement) -> Self {
        Self::Parameterized(statement)
    }
}

impl From<Vec<Statement>> for SqlInput {
    fn from(batch: Vec<Statement>) -> Self {
        Self::Batch(batch)
    }
}

impl Serialize for SqlInput {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Statement(sql) => sql.serialize(serializer),
            Self::Parameterized(statement) => statement.serialize(serializer),
            Self::Batch(batch) => batch.serialize(serializer),
        }
    }
}

/// Reduce any accepted input shape to the canonical `(statement, params)` list.
pub fn normalize(input: SqlInput) -> Vec<Statement> {
    match input {
        SqlInput::Statement(sql) => vec![Statement::new(sql)],
        SqlInput::Parameterized(statement) => vec![statement],
        SqlInput::Batch(batch) => batch,
    }
}

// Config files write a bare string, a `{sql, params}` map, or a list of either.
// `Statement` also deserializes from a sequence, so lists are tried first:
// a one-element list stays a batch.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawInput {
    Text(String),
    Many(Vec<RawStatement>),
    One(Statement),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawStatement {
    Text(String),
    Full(Statement),
}

impl From<RawInput> for SqlInput {
    fn from(raw: RawInput) -> Self {
        match raw {
            RawInput::Text(sql) => Self::Statement(sql),
            RawInput::One(statement) => Self::Parameterized(statement),
            RawInput::Many(items) => Self::Batch(
                items
                    .into_iter()
                    .map(|item| match item {
                        RawStatement::Text(sql) => Statement::new(sql),
                        RawStatement::Full(statement) => statement,
                    })
                    .collect(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{SqlInput, Statement, Value, normalize};

    #[test]
    fn bare_statement_normalizes_to_one_unit_without_params() {
        let units = normalize("DELETE FROM t".into());
        assert_eq!(units, vec![Statement::new("DELETE FROM t")]);
        assert!(units[0].params.is_empty());
    }

    #[test]
    fn parameterized_statement_keeps_params_in_order() {
        let input = SqlInput::from(
            Statement::new("UPDATE t SET a = ?, b = ? WHERE id = ?")
                .bind("x")
                .bind(2.5)
                .bind(4),
        );
        let units = normalize(input);

        assert_eq!(units.len(), 1);
        assert_eq!(units[0].sql, "UPDATE t SET a = ?, b = ? WHERE id = ?");
        assert_eq!(
            units[0].params,
            vec![Value::Text("x".into()), Value::Real(2.5), Value::Integer(4)]
        );
    }

    #[test]
    fn batch_is_returned_unchanged() {
        let batch = vec![
            Statement::with_params("INSERT INTO t (id) VALUES (?)", [1]),
            Statement::new("INSERT INTO t (id) VALUES (2)"),
        ];
        let units = normalize(SqlInput::Batch(batch.clone()));
        assert_eq!(units, batch);
    }

    #[test]
    fn single_element_batch_is_still_a_batch() {
        let input = SqlInput::from(vec![Statement::new("SELECT 1")]);
        assert!(input.is_batch());
        assert!(!SqlInput::from("SELECT 1").is_batch());
        assert!(!SqlInput::from(Statement::new("SELECT 1")).is_batch());
    }

    #[test]
    fn option_and_bool_values_convert() {
        assert_eq!(Value::from(None::<i64>), Value::Null);
        assert_eq!(Value::from(Some("a")), Value::Text("a".into()));
        assert_eq!(Value::from(true), Value::Integer(1));
    }

    #[test]
    fn statement_display_lists_params() {
        let statement = Statement::new("SELECT ?, ?").bind(1).bind("two");
        assert_eq!(statement.to_string(), "SELECT ?, ? with (1,two)");
    }

    #[test]
    fn deserializes_every_accepted_shape() {
        let bare: SqlInput = serde_yaml::from_str("\"CREATE TABLE t (id INTEGER)\"")
            .expect("bare statement should parse");
        assert_eq!(bare, SqlInput::Statement("CREATE TABLE t (id INTEGER)".into()));

        let one: SqlInput = serde_yaml::from_str("sql: INSERT INTO t VALUES (?)\nparams: [7]\n")
            .expect("parameterized statement should parse");
        assert_eq!(
            one,
            SqlInput::Parameterized(Statement::with_params("INSERT INTO t VALUES (?)", [7]))
        );

        let many: SqlInput = serde_yaml::from_str(
            "- CREATE TABLE a (id INTEGER)\n- sql: INSERT INTO a VALUES (?)\n  params: [\"x\", null]\n",
        )
        .expect("batch should parse");
        assert_eq!(
            many,
            SqlInput::Batch(vec![
                Statement::new("CREATE TABLE a (id INTEGER)"),
                Statement {
                    sql: "INSERT INTO a VALUES (?)".into(),
                    params: vec![Value::Text("x".into()), Value::Null],
                },
            ])
        );
    }

    #[test]
    fn one_element_list_deserializes_as_a_batch() {
        let input: SqlInput = serde_yaml::from_str("- CREATE TABLE a (id INTEGER)\n")
            .expect("one-element list should parse");
        assert!(input.is_batch());
        assert_eq!(
            input,
            SqlInput::Batch(vec![Statement::new("CREATE TABLE a (id INTEGER)")])
        );

        let json: SqlInput = serde_json::from_str(r#"["SELECT 1"]"#).expect("json list should parse");
        assert_eq!(json, SqlInput::Batch(vec![Statement::new("SELECT 1")]));

        let map: SqlInput = serde_json::from_str(r#"[{"sql": "SELECT ?", "params": [1]}]"#)
            .expect("list of maps should parse");
        assert_eq!(
            map,
            SqlInput::Batch(vec![Statement::with_params("SELECT ?", [1])])
        );
    }
}
