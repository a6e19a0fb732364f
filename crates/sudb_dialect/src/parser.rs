//! Whitespace-split statement parser.
//!
//! Tokens are separated by whitespace after trim. JSON tails (`VALUES`,
//! `WHERE` on the SELECT path) are re-joined with single spaces and handed
//! to serde_json; the UPDATE `SET` clause is parsed by a quote-aware state
//! machine so commas inside single-quoted strings survive.

use serde_json::Value;

use sudb_common::value::{Filter, Row};
use sudb_common::{SudbError, SudbResult};

use crate::statement::Statement;

/// Parse one dialect statement.
pub fn parse(sql: &str) -> SudbResult<Statement> {
    let parts: Vec<&str> = sql.split_whitespace().collect();
    if parts.is_empty() {
        return Err(SudbError::Parse("空SQL语句".into()));
    }

    match parts[0].to_ascii_uppercase().as_str() {
        "INSERT" => parse_insert(&parts),
        "SELECT" => parse_select(&parts),
        "UPDATE" => parse_update(&parts),
        "CREATE" => parse_create(&parts),
        "SHOW" => parse_show(&parts),
        "IMPORT" => parse_import(&parts),
        "EXPORT" => parse_export(&parts),
        _ => Err(SudbError::Parse(format!("不支持的SQL语句: {sql}"))),
    }
}

/// Split `collection.database` into its two components.
fn split_namespace(token: &str) -> SudbResult<(String, String)> {
    let names: Vec<&str> = token.split('.').collect();
    if names.len() != 2 || names[0].is_empty() || names[1].is_empty() {
        return Err(SudbError::Parse(
            "无效的数据库名称格式，应为: collection.database".into(),
        ));
    }
    Ok((names[0].to_string(), names[1].to_string()))
}

fn keyword_eq(token: &str, keyword: &str) -> bool {
    token.eq_ignore_ascii_case(keyword)
}

fn parse_json_object(tokens: &[&str], what: &str) -> SudbResult<Row> {
    let json = tokens.join(" ");
    let value: Value = serde_json::from_str(&json)
        .map_err(|e| SudbError::Parse(format!("解析{what}失败: {e}")))?;
    match value {
        Value::Object(map) => Ok(map),
        _ => Err(SudbError::Parse(format!("解析{what}失败: 需要JSON对象"))),
    }
}

fn parse_insert(parts: &[&str]) -> SudbResult<Statement> {
    if parts.len() < 5 {
        return Err(SudbError::Parse("无效的INSERT语句".into()));
    }
    if !keyword_eq(parts[1], "INTO") {
        return Err(SudbError::Parse("INSERT语句缺少INTO关键字".into()));
    }
    let (collection, database) = split_namespace(parts[2])?;
    if !keyword_eq(parts[3], "VALUES") {
        return Err(SudbError::Parse("INSERT语句缺少VALUES关键字".into()));
    }
    let row = parse_json_object(&parts[4..], "JSON数据")?;
    Ok(Statement::Insert {
        collection,
        database,
        row,
    })
}

fn parse_select(parts: &[&str]) -> SudbResult<Statement> {
    if parts.len() < 4 {
        return Err(SudbError::Parse("无效的SELECT语句".into()));
    }
    if !keyword_eq(parts[2], "FROM") {
        return Err(SudbError::Parse("SELECT语句缺少FROM关键字".into()));
    }

    let columns = if parts[1] == "*" {
        None
    } else {
        Some(
            parts[1]
                .split(',')
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty())
                .collect(),
        )
    };

    let (collection, database) = split_namespace(parts[3])?;

    let filter = if parts.len() > 4 {
        if !keyword_eq(parts[4], "WHERE") {
            return Err(SudbError::Parse("SELECT语句的WHERE子句无效".into()));
        }
        let filter: Filter = parse_json_object(&parts[5..], "WHERE条件")?;
        Some(filter)
    } else {
        None
    };

    Ok(Statement::Select {
        collection,
        database,
        columns,
        filter,
    })
}

fn parse_create(parts: &[&str]) -> SudbResult<Statement> {
    if parts.len() < 2 {
        return Err(SudbError::Parse("无效的CREATE语句".into()));
    }
    match parts[1].to_ascii_uppercase().as_str() {
        "COLLECTION" => {
            if parts.len() < 3 {
                return Err(SudbError::Parse("缺少集合名称".into()));
            }
            Ok(Statement::CreateCollection {
                name: parts[2].to_string(),
                owner: "root".to_string(),
            })
        }
        "DATABASE" => {
            if parts.len() < 3 {
                return Err(SudbError::Parse("缺少数据库名称".into()));
            }
            let (collection, database) = split_namespace(parts[2])?;

            let mut db_type = None;
            let mut description = String::new();
            let mut i = 3;
            while i < parts.len() {
                match parts[i].to_ascii_uppercase().as_str() {
                    "TYPE" => {
                        if i + 1 < parts.len() {
                            db_type = Some(parts[i + 1].parse()?);
                            i += 1;
                        }
                    }
                    "DESCRIPTION" => {
                        // Quoted descriptions keep interior whitespace: join
                        // tokens until the closing quote.
                        if i + 1 < parts.len() {
                            let (value, consumed) = take_quoted(&parts[i + 1..]);
                            description = value;
                            i += consumed;
                        }
                    }
                    _ => {}
                }
                i += 1;
            }

            Ok(Statement::CreateDatabase {
                collection,
                database,
                db_type: db_type
                    .ok_or_else(|| SudbError::Parse("CREATE DATABASE语句缺少TYPE".into()))?,
                description,
            })
        }
        other => Err(SudbError::Parse(format!("不支持的CREATE类型: {other}"))),
    }
}

/// Join tokens forming one single-quoted literal; returns the unquoted value
/// and how many tokens were consumed. An unquoted first token is taken as-is.
fn take_quoted(tokens: &[&str]) -> (String, usize) {
    if tokens.is_empty() {
        return (String::new(), 0);
    }
    if !tokens[0].starts_with('\'') {
        return (tokens[0].to_string(), 1);
    }
    let mut consumed = 1;
    let mut value = tokens[0].to_string();
    while !(value.len() > 1 && value.ends_with('\'')) && consumed < tokens.len() {
        value.push(' ');
        value.push_str(tokens[consumed]);
        consumed += 1;
    }
    (value.trim_matches('\'').to_string(), consumed)
}

fn parse_show(parts: &[&str]) -> SudbResult<Statement> {
    if parts.len() < 2 {
        return Err(SudbError::Parse("无效的SHOW语句".into()));
    }
    match parts[1].to_ascii_uppercase().as_str() {
        "COLLECTIONS" => Ok(Statement::ShowCollections),
        "DATABASES" => {
            if parts.len() < 4 || !keyword_eq(parts[2], "FROM") {
                return Err(SudbError::Parse("无效的SHOW DATABASES语句".into()));
            }
            Ok(Statement::ShowDatabases {
                collection: parts[3].to_string(),
            })
        }
        other => Err(SudbError::Parse(format!("不支持的SHOW类型: {other}"))),
    }
}

fn parse_import(parts: &[&str]) -> SudbResult<Statement> {
    // IMPORT FROM <path> TO <collection>
    if parts.len() < 5 || !keyword_eq(parts[1], "FROM") || !keyword_eq(parts[3], "TO") {
        return Err(SudbError::Parse(
            "无效的IMPORT语句，格式应为: IMPORT FROM filepath TO collection".into(),
        ));
    }
    Ok(Statement::Import {
        path: parts[2].to_string(),
        collection: parts[4].to_string(),
    })
}

fn parse_export(parts: &[&str]) -> SudbResult<Statement> {
    // EXPORT <coll>.<db> TO <path>
    if parts.len() < 4 || !keyword_eq(parts[2], "TO") {
        return Err(SudbError::Parse("无效的EXPORT语句".into()));
    }
    let (collection, database) = split_namespace(parts[1])?;
    Ok(Statement::Export {
        collection,
        database,
        path: parts[3..].join(" "),
    })
}

fn parse_update(parts: &[&str]) -> SudbResult<Statement> {
    if parts.len() < 4 {
        return Err(SudbError::Parse("无效的UPDATE语句".into()));
    }
    let (collection, database) = split_namespace(parts[1])?;

    let mut set_index = None;
    let mut where_index = None;
    for (i, part) in parts.iter().enumerate() {
        if keyword_eq(part, "SET") && set_index.is_none() {
            set_index = Some(i);
        } else if keyword_eq(part, "WHERE") {
            where_index = Some(i);
            break;
        }
    }
    let set_index = set_index.ok_or_else(|| SudbError::Parse("UPDATE语句缺少SET子句".into()))?;

    let set_end = where_index.unwrap_or(parts.len());
    let set_str = parts[set_index + 1..set_end].join(" ");
    let assignments = parse_set_clause(&set_str);
    if assignments.is_empty() {
        return Err(SudbError::Parse("UPDATE语句缺少SET子句".into()));
    }

    let filter = match where_index {
        Some(w) => Some(parse_update_where(&parts[w + 1..].join(" "))?),
        None => None,
    };

    Ok(Statement::Update {
        collection,
        database,
        assignments,
        filter,
    })
}

/// State-machine parse of `k1 = v1, k2 = 'a, b'` honoring single quotes.
fn parse_set_clause(set_str: &str) -> Row {
    let mut updates = Row::new();
    let mut key = String::new();
    let mut in_quote = false;
    let mut current = String::new();

    let mut push_pair = |key: &mut String, raw: &str| {
        if key.is_empty() {
            return;
        }
        let mut value = raw.trim().to_string();
        if value.starts_with('\'') && value.ends_with('\'') && value.len() >= 2 {
            value = value[1..value.len() - 1].to_string();
        }
        updates.insert(std::mem::take(key), Value::String(value));
    };

    for ch in set_str.chars() {
        match ch {
            '\'' => {
                in_quote = !in_quote;
                current.push(ch);
            }
            '=' if !in_quote => {
                key = current.trim().to_string();
                current.clear();
            }
            ',' if !in_quote => {
                let raw = std::mem::take(&mut current);
                push_pair(&mut key, &raw);
            }
            _ => current.push(ch),
        }
    }
    push_pair(&mut key, &current);
    updates
}

/// The UPDATE path supports exactly one `key = value` comparison.
/// A numeric-looking right-hand side is coerced to a double, else a string.
fn parse_update_where(where_str: &str) -> SudbResult<Filter> {
    let sides: Vec<&str> = where_str.split('=').collect();
    if sides.len() != 2 {
        return Err(SudbError::Parse("无效的WHERE子句格式".into()));
    }
    let key = sides[0].trim().to_string();
    let raw = sides[1].trim();

    let value = match raw.parse::<f64>() {
        Ok(n) => serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or_else(|| Value::String(raw.to_string())),
        Err(_) => Value::String(raw.to_string()),
    };

    let mut filter = Filter::new();
    filter.insert(key, value);
    Ok(filter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sudb_common::StorageType;

    #[test]
    fn test_parse_insert() {
        let stmt = parse(r#"INSERT INTO myapp.users VALUES {"name":"Alice","age":25}"#).unwrap();
        match stmt {
            Statement::Insert {
                collection,
                database,
                row,
            } => {
                assert_eq!(collection, "myapp");
                assert_eq!(database, "users");
                assert_eq!(row.get("name"), Some(&json!("Alice")));
                assert_eq!(row.get("age"), Some(&json!(25)));
            }
            other => panic!("expected Insert, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_insert_multiword_json() {
        let stmt = parse(r#"INSERT INTO c.d VALUES {"note": "hello   world"}"#).unwrap();
        match stmt {
            Statement::Insert { row, .. } => {
                // Interior runs of whitespace inside JSON tokens collapse to
                // single spaces; quoted JSON strings keep one separator.
                assert_eq!(row.get("note"), Some(&json!("hello world")));
            }
            other => panic!("expected Insert, got {other:?}"),
        }
    }

    #[test]
    fn test_insert_rejects_bad_namespace() {
        assert!(parse(r#"INSERT INTO users VALUES {"a":1}"#).is_err());
        assert!(parse(r#"INSERT INTO a.b.c VALUES {"a":1}"#).is_err());
    }

    #[test]
    fn test_insert_rejects_bad_json() {
        assert!(parse("INSERT INTO c.d VALUES {not json}").is_err());
        assert!(parse("INSERT INTO c.d VALUES [1,2]").is_err());
    }

    #[test]
    fn test_parse_select_star() {
        let stmt = parse("SELECT * FROM myapp.users").unwrap();
        assert_eq!(
            stmt,
            Statement::Select {
                collection: "myapp".into(),
                database: "users".into(),
                columns: None,
                filter: None,
            }
        );
    }

    #[test]
    fn test_parse_select_columns() {
        let stmt = parse("SELECT name,age FROM myapp.users").unwrap();
        match stmt {
            Statement::Select { columns, .. } => {
                assert_eq!(columns, Some(vec!["name".to_string(), "age".to_string()]));
            }
            other => panic!("expected Select, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_select_with_operator_filter() {
        let stmt =
            parse(r#"SELECT * FROM c.d WHERE {"age":{"operator":">","value":25}}"#).unwrap();
        match stmt {
            Statement::Select { filter, .. } => {
                let f = filter.unwrap();
                assert_eq!(f["age"]["operator"], json!(">"));
                assert_eq!(f["age"]["value"], json!(25));
            }
            other => panic!("expected Select, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_create_collection() {
        let stmt = parse("CREATE COLLECTION myapp").unwrap();
        assert_eq!(
            stmt,
            Statement::CreateCollection {
                name: "myapp".into(),
                owner: "root".into(),
            }
        );
    }

    #[test]
    fn test_parse_create_database() {
        let stmt =
            parse("CREATE DATABASE myapp.users TYPE json DESCRIPTION 'user records'").unwrap();
        assert_eq!(
            stmt,
            Statement::CreateDatabase {
                collection: "myapp".into(),
                database: "users".into(),
                db_type: StorageType::Json,
                description: "user records".into(),
            }
        );
    }

    #[test]
    fn test_parse_create_database_single_word_description() {
        let stmt = parse("CREATE DATABASE a.b TYPE table DESCRIPTION 'u'").unwrap();
        match stmt {
            Statement::CreateDatabase {
                db_type,
                description,
                ..
            } => {
                assert_eq!(db_type, StorageType::Table);
                assert_eq!(description, "u");
            }
            other => panic!("expected CreateDatabase, got {other:?}"),
        }
    }

    #[test]
    fn test_create_database_rejects_unknown_type() {
        assert!(parse("CREATE DATABASE a.b TYPE blob DESCRIPTION 'x'").is_err());
    }

    #[test]
    fn test_parse_show() {
        assert_eq!(parse("SHOW COLLECTIONS").unwrap(), Statement::ShowCollections);
        assert_eq!(
            parse("SHOW DATABASES FROM myapp").unwrap(),
            Statement::ShowDatabases {
                collection: "myapp".into()
            }
        );
        assert!(parse("SHOW DATABASES myapp").is_err());
        assert!(parse("SHOW TABLES").is_err());
    }

    #[test]
    fn test_parse_import() {
        let stmt = parse("IMPORT FROM dump.suql TO imported").unwrap();
        assert_eq!(
            stmt,
            Statement::Import {
                path: "dump.suql".into(),
                collection: "imported".into(),
            }
        );
        assert!(parse("IMPORT FROM dump.suql").is_err());
    }

    #[test]
    fn test_parse_export() {
        let stmt = parse("EXPORT myapp.users TO /tmp/dump.suql").unwrap();
        assert_eq!(
            stmt,
            Statement::Export {
                collection: "myapp".into(),
                database: "users".into(),
                path: "/tmp/dump.suql".into(),
            }
        );
    }

    #[test]
    fn test_parse_update_simple() {
        let stmt = parse("UPDATE c.d SET name = 'Bob' WHERE age = 25").unwrap();
        match stmt {
            Statement::Update {
                assignments,
                filter,
                ..
            } => {
                assert_eq!(assignments.get("name"), Some(&json!("Bob")));
                // Numeric-looking WHERE value is coerced to a double.
                assert_eq!(filter.unwrap().get("age"), Some(&json!(25.0)));
            }
            other => panic!("expected Update, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_update_quoted_comma() {
        let stmt = parse("UPDATE c.d SET note = 'a, b', city = 'Paris'").unwrap();
        match stmt {
            Statement::Update {
                assignments,
                filter,
                ..
            } => {
                assert_eq!(assignments.get("note"), Some(&json!("a, b")));
                assert_eq!(assignments.get("city"), Some(&json!("Paris")));
                assert!(filter.is_none());
            }
            other => panic!("expected Update, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_update_string_where() {
        let stmt = parse("UPDATE c.d SET age = 30 WHERE name = Alice").unwrap();
        match stmt {
            Statement::Update { filter, .. } => {
                assert_eq!(filter.unwrap().get("name"), Some(&json!("Alice")));
            }
            other => panic!("expected Update, got {other:?}"),
        }
    }

    #[test]
    fn test_update_requires_set() {
        assert!(parse("UPDATE c.d WHERE a = 1").is_err());
    }

    #[test]
    fn test_update_rejects_malformed_where() {
        assert!(parse("UPDATE c.d SET a = 1 WHERE bogus").is_err());
    }

    #[test]
    fn test_empty_statement() {
        assert!(parse("").is_err());
        assert!(parse("   ").is_err());
    }

    #[test]
    fn test_unknown_command() {
        assert!(parse("DROP TABLE t").is_err());
    }

    #[test]
    fn test_keywords_case_insensitive() {
        assert!(parse("select * from c.d").is_ok());
        assert!(parse(r#"insert into c.d values {"a":1}"#).is_ok());
    }
}
