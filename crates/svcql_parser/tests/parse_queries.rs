use svcql_parser::ast::{Expr, Literal, SelectItem};
use svcql_parser::parse;

#[test]
fn parse_simple_select() {
    let query = parse("select * from my_service;").unwrap();
    assert_eq!(vec![SelectItem::Wildcard], query.body.projections);
    assert_eq!("my_service", query.body.from.unwrap().to_string());
}

#[test]
fn parse_quoted_service_name() {
    let query = parse("SELECT \"Total Sales\" FROM \"Sales Service\"").unwrap();
    assert_eq!("Sales Service", query.body.from.unwrap().to_string());
    assert_eq!(
        Some("Total Sales".to_string()),
        query.body.projections[0].output_name()
    );
}

#[test]
fn parse_where_with_parameters() {
    let query = parse(
        "SELECT a FROM svc WHERE PARAMETER('region') = 'EU' AND a IN (1, 2, 3) AND b IS NULL",
    )
    .unwrap();
    let where_expr = query.body.where_expr.unwrap();
    assert_eq!(
        "PARAMETER('region') = 'EU' AND a IN (1, 2, 3) AND b IS NULL",
        where_expr.to_string()
    );
}

#[test]
fn parse_without_from() {
    let query = parse("SELECT 1").unwrap();
    assert!(query.body.from.is_none());
    assert_eq!(
        vec![SelectItem::Expr(Expr::Literal(Literal::Number("1".to_string())))],
        query.body.projections
    );
}

#[test]
fn reject_non_select() {
    parse("DELETE FROM svc").unwrap_err();
    parse("").unwrap_err();
    parse("SELECT a FROM svc extra tokens").unwrap_err();
}
