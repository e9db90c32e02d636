//! `#name#` variable substitution for stage scripts.

use std::collections::HashMap;

use regex::{Captures, Regex};

use crate::error::{QuerySetError, Result};
use crate::query::{Param, Set};

/// Variables supplied with an execution call.
pub type Vars = HashMap<String, String>;

lazy_static::lazy_static! {
    static ref TOKEN: Regex = Regex::new(r"#([A-Za-z_][A-Za-z0-9_.\-]*)#").unwrap();
}

/// Declared params referenced by `#name#` tokens, in order of first
/// appearance. Tokens that name no param are plain text.
pub fn referenced(script: &str, params: &[Param]) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for caps in TOKEN.captures_iter(script) {
        let name = &caps[1];
        if is_declared(name, params) && !names.iter().any(|n| n == name) {
            names.push(name.to_string());
        }
    }
    names
}

fn is_declared(name: &str, params: &[Param]) -> bool {
    params.iter().any(|p| p.name == name)
}

/// The value a declared param resolves to: the supplied one first, then
/// its default.
pub fn resolve<'a>(name: &str, params: &'a [Param], vars: &'a Vars) -> Option<&'a str> {
    let param = params.iter().find(|p| p.name == name)?;
    vars.get(name).map(String::as_str).or(param.default.as_deref())
}

/// Replaces every token that names a declared param. Fails on the first
/// such param that has neither a supplied value nor a default.
pub fn substitute(script: &str, params: &[Param], vars: &Vars) -> Result<String> {
    if let Some(missing) = referenced(script, params)
        .into_iter()
        .find(|name| resolve(name, params, vars).is_none())
    {
        return Err(QuerySetError::MissingVariable(missing));
    }
    let replaced = TOKEN.replace_all(script, |caps: &Captures| match resolve(&caps[1], params, vars) {
        Some(value) => value.to_string(),
        None => caps[0].to_string(),
    });
    Ok(replaced.into_owned())
}

/// Checks, before anything runs, that every declared param of the set can
/// be resolved.
pub fn validate(set: &Set, vars: &Vars) -> Result<()> {
    match set.params.iter().find(|p| resolve(&p.name, &set.params, vars).is_none()) {
        Some(param) => Err(QuerySetError::MissingVariable(param.name.clone())),
        None => Ok(()),
    }
}
