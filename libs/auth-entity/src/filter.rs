use serde::{Deserialize, Serialize};

/// Comparison operators the token store's filter language supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl Operator {
    /// The operator as it appears in a SQL `WHERE` clause fragment.
    pub fn as_sql(self) -> &'static str {
        match self {
            Operator::Eq => "=",
            Operator::Ne => "<>",
            Operator::Gt => ">",
            Operator::Gte => ">=",
            Operator::Lt => "<",
            Operator::Lte => "<=",
        }
    }
}

/// One clause of a flat conjunctive filter: `attribute <operator> value`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Filter {
    pub attribute: String,
    pub operator: Operator,
    pub value: String,
}

impl Filter {
    pub fn new(attribute: impl Into<String>, operator: Operator, value: impl Into<String>) -> Self {
        Self { attribute: attribute.into(), operator, value: value.into() }
    }

    pub fn user_id_eq(user_id: impl Into<String>) -> Self {
        Self::new("user_id", Operator::Eq, user_id)
    }
}
