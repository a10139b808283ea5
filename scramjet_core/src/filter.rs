//! Declarative predicates over a document's JSON fields.
//!
//! A [`Filter`] is rendered into a `QueryBuilder` fragment with every field name and
//! value bound as a parameter. Only the comparator is written into the SQL text, and it
//! comes from a closed enum.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sqlx::{Postgres, QueryBuilder};

use crate::{Error, Result};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparator {
    #[serde(rename = "=")]
    Eq,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = ">=")]
    Gte,
    #[serde(rename = "<=")]
    Lte,
    #[serde(rename = "IN", alias = "in")]
    In,
}

impl Comparator {
    pub fn as_sql(self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Gt => ">",
            Self::Lt => "<",
            Self::Gte => ">=",
            Self::Lte => "<=",
            Self::In => "IN",
        }
    }
}

impl fmt::Display for Comparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

impl FromStr for Comparator {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "=" | "EQ" => Ok(Self::Eq),
            ">" | "GT" => Ok(Self::Gt),
            "<" | "LT" => Ok(Self::Lt),
            ">=" | "GTE" => Ok(Self::Gte),
            "<=" | "LTE" => Ok(Self::Lte),
            "IN" => Ok(Self::In),
            other => Err(Error::InvalidInput(format!("unknown comparator: {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterValue {
    One(String),
    Many(Vec<String>),
}

/// Restricts the parent filter to values of `match_field` found in records of
/// `type_name` whose `parent_match` field equals `value`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubFilter {
    #[serde(rename = "type")]
    pub type_name: String,
    pub match_field: String,
    pub parent_match: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    pub field: String,
    #[serde(rename = "compare")]
    pub comparator: Comparator,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<FilterValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_filter: Option<SubFilter>,
}

impl Filter {
    pub fn new(field: impl Into<String>, comparator: Comparator, value: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            comparator,
            value: Some(FilterValue::One(value.into())),
            sub_filter: None,
        }
    }

    pub fn eq(field: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(field, Comparator::Eq, value)
    }

    pub fn any_of<I, S>(field: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            field: field.into(),
            comparator: Comparator::In,
            value: Some(FilterValue::Many(values.into_iter().map(Into::into).collect())),
            sub_filter: None,
        }
    }

    /// `field IN (<match_field of type_name where parent_match = value>)`.
    pub fn correlated(field: impl Into<String>, sub_filter: SubFilter) -> Self {
        Self {
            field: field.into(),
            comparator: Comparator::In,
            value: None,
            sub_filter: Some(sub_filter),
        }
    }

    #[tracing::instrument(level = "debug")]
    pub fn validate(&self) -> Result<()> {
        if self.field.trim().is_empty() {
            return Err(Error::InvalidInput("filter field is empty".to_string()));
        }
        if let Some(sf) = &self.sub_filter {
            if self.comparator != Comparator::In {
                return Err(Error::InvalidInput(
                    "sub-filter requires the IN comparator".to_string(),
                ));
            }
            if sf.type_name.trim().is_empty()
                || sf.match_field.trim().is_empty()
                || sf.parent_match.trim().is_empty()
            {
                return Err(Error::InvalidInput(
                    "sub-filter type, match_field and parent_match are required".to_string(),
                ));
            }
            return Ok(());
        }
        match (&self.value, self.comparator) {
            (None, _) => Err(Error::InvalidInput(format!(
                "filter on {} has no value",
                self.field
            ))),
            (Some(FilterValue::One(_)), Comparator::In) => Err(Error::InvalidInput(
                "IN requires a list of values".to_string(),
            )),
            (Some(FilterValue::Many(_)), c) if c != Comparator::In => Err(Error::InvalidInput(
                format!("{c} requires a single value"),
            )),
            _ => Ok(()),
        }
    }
}

/// Which table (and JSON column) a filter is evaluated against.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FilterTarget {
    Staging,
    Resources,
}

impl FilterTarget {
    pub fn table(self) -> &'static str {
        match self {
            Self::Staging => "staging",
            Self::Resources => "resources",
        }
    }

    pub fn json_column(self) -> &'static str {
        match self {
            Self::Staging => "data",
            Self::Resources => "data_indexed",
        }
    }
}

/// Append `filter` as a boolean expression. The caller supplies the surrounding `AND`.
///
/// An empty IN list or an empty correlated set matches nothing.
pub fn push_filter(
    qb: &mut QueryBuilder<'_, Postgres>,
    filter: &Filter,
    target: FilterTarget,
) -> Result<()> {
    filter.validate()?;
    let col = target.json_column();

    qb.push(format_args!("{col}->>"));
    qb.push_bind(filter.field.clone());

    if let Some(sf) = &filter.sub_filter {
        qb.push(format_args!(" IN (SELECT sub.{col}->>"));
        qb.push_bind(sf.match_field.clone());
        qb.push(format_args!(" FROM {} sub WHERE sub.type = ", target.table()));
        qb.push_bind(sf.type_name.clone());
        qb.push(format_args!(" AND sub.{col}->>"));
        qb.push_bind(sf.parent_match.clone());
        qb.push(" = ");
        qb.push_bind(sf.value.clone());
        if target == FilterTarget::Staging {
            qb.push(" AND sub.to_delete = FALSE");
        }
        qb.push(")");
        return Ok(());
    }

    match &filter.value {
        Some(FilterValue::Many(values)) => {
            qb.push(" = ANY(");
            qb.push_bind(values.clone());
            qb.push(")");
        }
        Some(FilterValue::One(value)) => {
            qb.push(format_args!(" {} ", filter.comparator.as_sql()));
            qb.push_bind(value.clone());
        }
        None => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render(filter: &Filter, target: FilterTarget) -> String {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT id FROM t WHERE type = ");
        qb.push_bind("person".to_string());
        qb.push(" AND ");
        push_filter(&mut qb, filter, target).expect("filter");
        qb.sql().to_string()
    }

    #[test]
    fn plain_filter_binds_field_and_value() {
        let sql = render(&Filter::new("age", Comparator::Gte, "30"), FilterTarget::Staging);
        assert_eq!(
            sql,
            "SELECT id FROM t WHERE type = $1 AND data->>$2 >= $3"
        );
    }

    #[test]
    fn in_filter_uses_any_over_array() {
        let sql = render(
            &Filter::any_of("city", ["Oslo", "Bergen"]),
            FilterTarget::Resources,
        );
        assert_eq!(
            sql,
            "SELECT id FROM t WHERE type = $1 AND data_indexed->>$2 = ANY($3)"
        );
    }

    #[test]
    fn correlated_filter_renders_semi_join() {
        let filter = Filter::correlated(
            "department_id",
            SubFilter {
                type_name: "department".to_string(),
                match_field: "id".to_string(),
                parent_match: "name".to_string(),
                value: "Sales".to_string(),
            },
        );
        let sql = render(&filter, FilterTarget::Staging);
        assert_eq!(
            sql,
            "SELECT id FROM t WHERE type = $1 AND data->>$2 IN (SELECT sub.data->>$3 \
             FROM staging sub WHERE sub.type = $4 AND sub.data->>$5 = $6 AND sub.to_delete = FALSE)"
        );
    }

    #[test]
    fn field_names_are_never_interpolated() {
        let hostile = Filter::eq("x'; DROP TABLE staging; --", "1");
        let sql = render(&hostile, FilterTarget::Staging);
        assert!(!sql.contains("DROP"));
    }

    #[test]
    fn validate_checks_value_shape() {
        let mut f = Filter::eq("a", "1");
        f.comparator = Comparator::In;
        assert!(f.validate().is_err());

        let mut f = Filter::any_of("a", ["1"]);
        f.comparator = Comparator::Lt;
        assert!(f.validate().is_err());

        let mut f = Filter::eq("a", "1");
        f.value = None;
        assert!(f.validate().is_err());

        assert!(Filter::eq(" ", "1").validate().is_err());
        assert!(Filter::any_of("a", Vec::<String>::new()).validate().is_ok());
    }

    #[test]
    fn comparator_parses_and_deserializes() {
        assert_eq!("gte".parse::<Comparator>().expect("cmp"), Comparator::Gte);
        assert_eq!("IN".parse::<Comparator>().expect("cmp"), Comparator::In);
        assert!("LIKE".parse::<Comparator>().is_err());

        let f: Filter = serde_json::from_value(serde_json::json!({
            "field": "age",
            "compare": ">",
            "value": "30"
        }))
        .expect("filter");
        assert_eq!(f, Filter::new("age", Comparator::Gt, "30"));
    }
}
