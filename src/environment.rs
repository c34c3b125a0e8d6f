//! Environment detection from API tokens.
//!
//! Client tokens have the shape `<project>:<environment>.<hash>`, so the environment a client
//! talks to can be read off its `Authorization` header.

/// Extract the environment from the `Authorization` entry of `headers`.
///
/// Header names are compared case-insensitively. Returns `None` when the header is missing or the
/// token does not have the `<project>:<environment>.<hash>` shape.
pub fn environment_from_headers<'a, I, K, V>(headers: I) -> Option<String>
where
    I: IntoIterator<Item = &'a (K, V)>,
    K: AsRef<str> + 'a,
    V: AsRef<str> + 'a,
{
    let authorization = headers
        .into_iter()
        .find(|(name, _)| name.as_ref().eq_ignore_ascii_case("authorization"))
        .map(|(_, value)| value.as_ref())?;

    environment_from_token(authorization)
}

fn environment_from_token(token: &str) -> Option<String> {
    let (_project, after_colon) = token.split_once(':')?;
    let (environment, _hash) = after_colon.split_once('.')?;

    if environment.is_empty() {
        None
    } else {
        Some(environment.to_owned())
    }
}
