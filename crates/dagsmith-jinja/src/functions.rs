//! dbt-style Jinja functions
//!
//! `ref()`, `source()` and `var()` resolve against the tables built in
//! [`crate::context`]; they never invent a relation name.

use minijinja::value::Kwargs;
use minijinja::{Error, ErrorKind, State, Value};

use crate::context::RESOLVER_KEY;

fn resolver_table(state: &State, table: &str) -> Result<Value, Error> {
    let resolver = state.lookup(RESOLVER_KEY).ok_or_else(|| {
        Error::new(ErrorKind::InvalidOperation, "render context is missing resolver tables")
    })?;
    resolver.get_attr(table)
}

fn lookup_str(table: &Value, key: &str) -> Option<String> {
    table
        .get_attr(key)
        .ok()
        .filter(|v| !v.is_undefined() && !v.is_none())
        .and_then(|v| v.as_str().map(str::to_string))
}

/// ref() function - references another node
///
/// Usage in Jinja: {{ ref('model_name') }} or {{ ref('package', 'model_name') }}
/// Only declared dependencies resolve.
pub fn ref_function(state: &State, model_or_package: String, model_name: Option<String>) -> Result<Value, Error> {
    let refs = resolver_table(state, "refs")?;

    let key = match &model_name {
        Some(model) => format!("{}.{}", model_or_package, model),
        None => model_or_package,
    };

    lookup_str(&refs, &key).map(Value::from).ok_or_else(|| {
        Error::new(
            ErrorKind::UndefinedError,
            format!("'{}' is not a declared dependency of this node", key),
        )
    })
}

/// source() function - references a source table
///
/// Usage in Jinja: {{ source('source_name', 'table_name') }}
pub fn source_function(state: &State, source_name: String, table_name: String) -> Result<Value, Error> {
    let sources = resolver_table(state, "sources")?;
    let key = format!("{}.{}", source_name, table_name);

    lookup_str(&sources, &key).map(Value::from).ok_or_else(|| {
        Error::new(
            ErrorKind::UndefinedError,
            format!("'{}' is not a declared source of this node", key),
        )
    })
}

/// var() function - accesses project variables merged with run overrides
///
/// Usage in Jinja: {{ var('variable_name') }} or {{ var('variable_name', 'default') }}
pub fn var_function(state: &State, var_name: String, default: Option<Value>) -> Result<Value, Error> {
    let vars = resolver_table(state, "vars")?;

    match vars.get_attr(&var_name) {
        Ok(value) if !value.is_undefined() => Ok(value),
        _ => default.ok_or_else(|| {
            Error::new(
                ErrorKind::UndefinedError,
                format!("Required var '{}' not found", var_name),
            )
        }),
    }
}

/// env_var() function - reads a process environment variable
///
/// Usage in Jinja: {{ env_var('DBT_USER') }} or {{ env_var('DBT_USER', 'anon') }}
pub fn env_var_function(name: String, default: Option<String>) -> Result<Value, Error> {
    match std::env::var(&name) {
        Ok(value) => Ok(Value::from(value)),
        Err(_) => default.map(Value::from).ok_or_else(|| {
            Error::new(
                ErrorKind::UndefinedError,
                format!("Env var required but not provided: '{}'", name),
            )
        }),
    }
}

/// config() function - in-template configuration
///
/// Usage in Jinja: {{ config(materialized='table') }}
/// Configuration is resolved before rendering, so this renders nothing.
pub fn config_function(kwargs: Kwargs) -> Result<Value, Error> {
    let keys: Vec<String> = kwargs.args().map(str::to_string).collect();
    for key in keys {
        let _: Value = kwargs.get(&key)?;
    }
    Ok(Value::from(""))
}
