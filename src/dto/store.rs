use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use validator::Validate;

use crate::{
    dao::models::{Filter, OrderBy},
    error::AppError,
};

/// Query string scoping a read, write or subscription.
#[derive(Debug, Default, Deserialize, Validate, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct RowQuery {
    /// JSON object of column equalities, e.g. `{"game_id":"ABC123"}`.
    pub filter: Option<String>,
    /// Column to sort selected rows on.
    #[validate(length(min = 1))]
    pub order_by: Option<String>,
    /// Sort from the largest value down.
    #[serde(default)]
    pub descending: bool,
}

impl RowQuery {
    /// Decode the filter, matching every row when none was sent.
    pub fn filter(&self) -> Result<Filter, AppError> {
        match self.filter.as_deref() {
            None | Some("") => Ok(Filter::all()),
            Some(raw) => serde_json::from_str(raw)
                .map_err(|err| AppError::BadRequest(format!("invalid filter: {err}"))),
        }
    }

    /// Requested sort order, if any.
    pub fn order_by(&self) -> Option<OrderBy> {
        self.order_by.as_ref().map(|column| OrderBy {
            column: column.clone(),
            descending: self.descending,
        })
    }
}

/// Number of rows an update or delete touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct AffectedRows {
    pub affected: usize,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn filter_decodes_column_equalities() {
        let query = RowQuery {
            filter: Some(r#"{"game_id":"ABC123"}"#.into()),
            ..RowQuery::default()
        };
        let filter = query.filter().unwrap();
        assert!(filter.matches(&json!({"id": "p1", "game_id": "ABC123"})));
        assert!(!filter.matches(&json!({"id": "p2", "game_id": "ZZZ999"})));
    }

    #[test]
    fn missing_filter_matches_everything_and_bad_json_is_rejected() {
        assert!(RowQuery::default().filter().unwrap().matches(&json!({"id": "x"})));

        let query = RowQuery {
            filter: Some("{not json".into()),
            ..RowQuery::default()
        };
        assert!(matches!(query.filter(), Err(AppError::BadRequest(_))));
    }

    #[test]
    fn empty_order_column_fails_validation() {
        let query = RowQuery {
            order_by: Some(String::new()),
            ..RowQuery::default()
        };
        assert!(query.validate().is_err());
        assert_eq!(
            RowQuery {
                order_by: Some("joined_at".into()),
                descending: true,
                ..RowQuery::default()
            }
            .order_by(),
            Some(OrderBy {
                column: "joined_at".into(),
                descending: true,
            })
        );
    }
}
