//! Connection-string parsing.
//!
//! The grammar is a `;`-separated list of `key=value` pairs. A value is either
//! bare text without `;`, or wrapped in `'` or `"` where a doubled wrapping
//! quote stands for one literal quote. What counts as a delimiter depends on
//! the opening quote, so this is a small scanner rather than a regex.

pub mod models;

use std::iter::Peekable;
use std::str::CharIndices;

use crate::utils::errors::{ConnectionStringError, MissingField};
use crate::utils::mask::SecretMasker;

pub use models::{AuthenticationMode, ConnectionDescriptor, Password};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Key {
    User,
    Password,
    Database,
    Server,
    Authentication,
}

fn classify_key(key: &str) -> Option<Key> {
    let normalized = key
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_ascii_lowercase();
    match normalized.as_str() {
        "user id" | "userid" | "uid" | "user" => Some(Key::User),
        "password" | "pwd" => Some(Key::Password),
        "initial catalog" | "database" => Some(Key::Database),
        "server" | "data source" | "address" | "addr" | "network address" => Some(Key::Server),
        "authentication" => Some(Key::Authentication),
        _ => None,
    }
}

struct Scanner<'a> {
    chars: Peekable<CharIndices<'a>>,
}

impl<'a> Scanner<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            chars: text.char_indices().peekable(),
        }
    }

    fn peek(&mut self) -> Option<char> {
        self.chars.peek().map(|(_, c)| *c)
    }

    fn bump(&mut self) -> Option<char> {
        self.chars.next().map(|(_, c)| c)
    }

    fn skip_whitespace(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.bump();
        }
    }

    fn skip_separators(&mut self) {
        while self.peek().is_some_and(|c| c.is_whitespace() || c == ';') {
            self.bump();
        }
    }

    fn read_key(&mut self) -> Result<String, ConnectionStringError> {
        let mut key = String::new();
        loop {
            match self.peek() {
                Some('=') => {
                    self.bump();
                    break;
                }
                Some(';') | None => {
                    return Err(ConnectionStringError::Malformed(format!(
                        "expected '=' after '{}'",
                        key.trim()
                    )));
                }
                Some(c) => {
                    key.push(c);
                    self.bump();
                }
            }
        }
        let key = key.trim();
        if key.is_empty() {
            return Err(ConnectionStringError::Malformed(
                "found a value without a key".to_string(),
            ));
        }
        Ok(key.to_string())
    }

    fn read_value(&mut self, key: &str) -> Result<String, ConnectionStringError> {
        self.skip_whitespace();
        match self.peek() {
            Some(quote @ ('\'' | '"')) => {
                self.bump();
                let value = self.read_quoted(quote, key)?;
                self.skip_whitespace();
                match self.peek() {
                    Some(';') | None => Ok(value),
                    Some(c) => Err(ConnectionStringError::Malformed(format!(
                        "unexpected '{}' after the quoted value of '{}'",
                        c, key
                    ))),
                }
            }
            _ => {
                let mut value = String::new();
                while let Some(c) = self.peek() {
                    if c == ';' {
                        break;
                    }
                    value.push(c);
                    self.bump();
                }
                Ok(value.trim().to_string())
            }
        }
    }

    fn read_quoted(&mut self, quote: char, key: &str) -> Result<String, ConnectionStringError> {
        let mut value = String::new();
        loop {
            match self.bump() {
                None => {
                    return Err(ConnectionStringError::Malformed(format!(
                        "the value of '{}' is missing its closing {} quote",
                        key, quote
                    )));
                }
                Some(c) if c == quote => {
                    if self.peek() == Some(quote) {
                        self.bump();
                        value.push(quote);
                    } else {
                        return Ok(value);
                    }
                }
                Some(c) => value.push(c),
            }
        }
    }
}

/// Splits `text` into raw `(key, value)` pairs with quotes resolved.
pub fn tokenize(text: &str) -> Result<Vec<(String, String)>, ConnectionStringError> {
    let mut scanner = Scanner::new(text);
    let mut pairs = Vec::new();
    loop {
        scanner.skip_separators();
        if scanner.peek().is_none() {
            break;
        }
        let key = scanner.read_key()?;
        let value = scanner.read_value(&key)?;
        pairs.push((key, value));
    }
    Ok(pairs)
}

fn split_server(raw: &str) -> Result<(String, Option<u16>), ConnectionStringError> {
    let mut server = raw.trim();
    if server.get(..4).is_some_and(|prefix| prefix.eq_ignore_ascii_case("tcp:")) {
        server = &server[4..];
    }
    match server.rsplit_once(',') {
        Some((host, port)) => {
            let port = port.trim().parse::<u16>().map_err(|_| {
                ConnectionStringError::Malformed(format!("'{}' is not a valid port", port.trim()))
            })?;
            Ok((host.trim().to_string(), Some(port)))
        }
        None => Ok((server.to_string(), None)),
    }
}

fn quote_value(value: &str) -> String {
    let needs_quotes = value.contains(';')
        || value.starts_with('\'')
        || value.starts_with('"')
        || value.trim() != value;
    if !needs_quotes {
        return value.to_string();
    }
    if value.contains('"') && !value.contains('\'') {
        format!("'{}'", value)
    } else {
        format!("\"{}\"", value.replace('"', "\"\""))
    }
}

impl ConnectionDescriptor {
    /// Parses and validates `text`. On success the password is handed to
    /// `masker` before the descriptor is returned.
    pub fn parse(text: &str, masker: &dyn SecretMasker) -> Result<Self, ConnectionStringError> {
        let mut server = String::new();
        let mut port = None;
        let mut database = String::new();
        let mut user_id = String::new();
        let mut password = String::new();
        let mut authentication = None;
        let mut extra: Vec<(String, String)> = Vec::new();

        for (key, value) in tokenize(text)? {
            match classify_key(&key) {
                Some(Key::User) => user_id = value,
                Some(Key::Password) => password = value,
                Some(Key::Database) => database = value,
                Some(Key::Server) => {
                    let (host, parsed_port) = split_server(&value)?;
                    server = host;
                    port = parsed_port;
                }
                Some(Key::Authentication) => {
                    let mode = AuthenticationMode::from_value(&value)
                        .ok_or_else(|| ConnectionStringError::UnsupportedAuthentication(value))?;
                    authentication = Some(mode);
                }
                None => {
                    extra.retain(|(existing, _)| !existing.eq_ignore_ascii_case(&key));
                    extra.push((key, value));
                }
            }
        }

        let mode = authentication.unwrap_or_default();
        if mode.requires_credentials() {
            let (user_field, secret_field) = match mode {
                AuthenticationMode::ActiveDirectoryServicePrincipal => {
                    (MissingField::ClientId, MissingField::ClientSecret)
                }
                _ => (MissingField::User, MissingField::Password),
            };
            if user_id.is_empty() {
                return Err(ConnectionStringError::MissingField(user_field));
            }
            if password.is_empty() {
                return Err(ConnectionStringError::MissingField(secret_field));
            }
        }
        if database.is_empty() {
            return Err(ConnectionStringError::MissingField(MissingField::Database));
        }
        if server.is_empty() {
            return Err(ConnectionStringError::MissingField(MissingField::Server));
        }

        if !password.is_empty() {
            masker.register(&password);
        }

        Ok(Self {
            server,
            port,
            database,
            user_id,
            password: Password::new(password),
            authentication,
            extra,
        })
    }

    /// Writes the descriptor back out as connection-string text, quoting
    /// values where the grammar requires it. The output contains the password.
    pub fn to_connection_string(&self) -> String {
        let mut parts = vec![
            format!("Server={}", quote_value(&self.server_address())),
            format!("Initial Catalog={}", quote_value(&self.database)),
        ];
        if !self.user_id.is_empty() {
            parts.push(format!("User ID={}", quote_value(&self.user_id)));
        }
        if !self.password.is_empty() {
            parts.push(format!("Password={}", quote_value(self.password.expose())));
        }
        if let Some(mode) = self.authentication {
            parts.push(format!("Authentication={}", quote_value(mode.as_str())));
        }
        for (key, value) in &self.extra {
            parts.push(format!("{}={}", key, quote_value(value)));
        }
        parts.join(";")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::mask::SecretRegistry;

    fn parse(text: &str) -> Result<ConnectionDescriptor, ConnectionStringError> {
        ConnectionDescriptor::parse(text, &SecretRegistry::new())
    }

    fn message(text: &str) -> String {
        parse(text).unwrap_err().to_string()
    }

    #[test]
    fn test_parse_basic() {
        let d = parse("Server=tcp:test1.database.windows.net,1433;Initial Catalog=testdb;User Id=user;Password=pass;").unwrap();
        assert_eq!(d.server, "test1.database.windows.net");
        assert_eq!(d.port, Some(1433));
        assert_eq!(d.database, "testdb");
        assert_eq!(d.user_id, "user");
        assert_eq!(d.password.expose(), "pass");
        assert_eq!(d.authentication_mode(), AuthenticationMode::SqlPassword);
    }

    #[test]
    fn test_parse_synonyms_and_case() {
        let d = parse("data source=srv;DATABASE=db;uid=u;pwd=p").unwrap();
        assert_eq!(d.server, "srv");
        assert_eq!(d.database, "db");
        assert_eq!(d.user_id, "u");
        assert_eq!(d.password.expose(), "p");
    }

    #[test]
    fn test_server_port_variants() {
        let d = parse("Server=database.windows.net,1433;Database=db;User Id=u;Password=p").unwrap();
        assert_eq!(d.server, "database.windows.net");
        assert_eq!(d.port, Some(1433));

        let d = parse("Server=test1.database.windows.net;Database=db;User Id=u;Password=p").unwrap();
        assert_eq!(d.server, "test1.database.windows.net");
        assert_eq!(d.port, None);

        assert!(matches!(
            parse("Server=srv,abc;Database=db;User Id=u;Password=p"),
            Err(ConnectionStringError::Malformed(_))
        ));
    }

    #[test]
    fn test_double_quoted_password() {
        let d = parse(r#"Server=srv;Database=db;User Id=u;Password="ab'=abcdf''c;123""#).unwrap();
        assert_eq!(d.password.expose(), "ab'=abcdf''c;123");
    }

    #[test]
    fn test_single_quoted_password() {
        let d = parse(r#"Server=srv;Database=db;User Id=u;Password='abc;1""2"adf=33'"#).unwrap();
        assert_eq!(d.password.expose(), r#"abc;1""2"adf=33"#);
    }

    #[test]
    fn test_escaped_quotes_collapse() {
        let d = parse(r#"Server=srv;Database=db;User Id=u;Password="a""b";"#).unwrap();
        assert_eq!(d.password.expose(), r#"a"b"#);
        let d = parse("Server=srv;Database=db;User Id=u;Password='it''s'").unwrap();
        assert_eq!(d.password.expose(), "it's");
    }

    #[test]
    fn test_unterminated_quote_fails() {
        for text in [
            r#"Server=srv;Database=db;User Id=u;Password="ab'=abcdf''c;123"#,
            r#"Server=srv;Database=db;User Id=u;Password="ab'=abcdf''c;123;Initial Catalog=db"#,
            "Server=srv;Database=db;User Id=u;Password='abc",
        ] {
            assert!(matches!(parse(text), Err(ConnectionStringError::Malformed(_))), "{}", text);
        }
    }

    #[test]
    fn test_bare_quote_inside_quoted_value_fails() {
        assert!(matches!(
            parse(r#"Server=srv;Database=db;User Id=u;Password="ab"c";"#),
            Err(ConnectionStringError::Malformed(_))
        ));
    }

    #[test]
    fn test_segment_without_equals_fails() {
        assert!(matches!(
            parse("Server=srv;Database=db;garbage;User Id=u;Password=p"),
            Err(ConnectionStringError::Malformed(_))
        ));
        assert!(matches!(parse("=value"), Err(ConnectionStringError::Malformed(_))));
    }

    #[test]
    fn test_missing_fields_named() {
        assert_eq!(
            message("Server=srv;Database=db;Password=p"),
            "Invalid connection string. Please ensure 'User' or 'User ID' is provided in the connection string."
        );
        assert_eq!(
            message("Server=srv;Database=db;User Id=u"),
            "Invalid connection string. Please ensure 'Password' is provided in the connection string."
        );
        assert_eq!(
            message("Server=srv;User Id=u;Password=p"),
            "Invalid connection string. Please ensure 'Database' or 'Initial Catalog' is provided in the connection string."
        );
        assert_eq!(
            message("Database=db;User Id=u;Password=p"),
            "Invalid connection string. Please ensure 'Server' or 'Data Source' is provided in the connection string."
        );
    }

    #[test]
    fn test_service_principal_messages() {
        assert_eq!(
            message("Server=srv;Database=db;Password=p;Authentication=Active Directory Service Principal"),
            "Invalid connection string. Please ensure client ID is provided in the 'User' or 'User ID' field of the connection string."
        );
        assert_eq!(
            message("Server=srv;Database=db;User Id=id;Authentication='ActiveDirectoryServicePrincipal'"),
            "Invalid connection string. Please ensure client secret is provided in the 'Password' field of the connection string."
        );
    }

    #[test]
    fn test_authentication_aliases() {
        for spelling in [
            "Active Directory Password",
            "'ActiveDirectoryPassword'",
            "\"Active Directory Password\"",
            "active directory password",
        ] {
            let text = format!("Server=srv;Database=db;User Id=u;Password=p;Authentication={}", spelling);
            let d = parse(&text).unwrap();
            assert_eq!(d.authentication, Some(AuthenticationMode::ActiveDirectoryPassword));

            let text = format!("Server=srv;Database=db;Password=p;Authentication={}", spelling);
            assert_eq!(
                parse(&text).unwrap_err(),
                ConnectionStringError::MissingField(MissingField::User)
            );
        }
    }

    #[test]
    fn test_active_directory_default_needs_no_credentials() {
        let d = parse("Server=srv;Database=db;Authentication=\"Active Directory Default\"").unwrap();
        assert_eq!(d.authentication_mode(), AuthenticationMode::ActiveDirectoryDefault);
        assert!(d.user_id.is_empty());
        assert!(d.password.is_empty());

        assert_eq!(
            message("Server=srv;Authentication=ActiveDirectoryDefault"),
            "Invalid connection string. Please ensure 'Database' or 'Initial Catalog' is provided in the connection string."
        );
    }

    #[test]
    fn test_unsupported_authentication() {
        assert_eq!(
            message("Server=srv;Database=db;User Id=u;Password=p;Authentication=Active Directory Integrated"),
            "Authentication type 'Active Directory Integrated' is not supported."
        );
    }

    #[test]
    fn test_password_registered_with_masker() {
        let registry = SecretRegistry::new();
        ConnectionDescriptor::parse("Server=srv;Database=db;User Id=u;Password=\"p;w\"", &registry).unwrap();
        assert!(registry.contains("p;w"));
    }

    #[test]
    fn test_failed_parse_registers_nothing() {
        let registry = SecretRegistry::new();
        assert!(ConnectionDescriptor::parse("Server=srv;User Id=u;Password=p", &registry).is_err());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_debug_hides_password() {
        let d = parse("Server=srv;Database=db;User Id=u;Password=topsecret").unwrap();
        assert!(!format!("{:?}", d).contains("topsecret"));
    }

    #[test]
    fn test_round_trip_is_stable() {
        for text in [
            "Server=tcp:srv.database.windows.net,1433;Initial Catalog=db;User Id=u;Password=p",
            r#"Server=srv;Database=db;User Id=u;Password="ab'=abcdf''c;123";Encrypt=True"#,
            r#"Server=srv;Database=db;User Id=u;Password='abc;1""2"adf=33'"#,
            r##"Server=srv;Database=db;User Id=u;Password="both ' and "" ;""##,
            "Server=srv;Database=db;Authentication=Active Directory Default",
        ] {
            let first = parse(text).unwrap();
            let second = parse(&first.to_connection_string()).unwrap();
            let third = parse(&second.to_connection_string()).unwrap();
            assert_eq!(first, second, "{}", text);
            assert_eq!(second, third, "{}", text);
        }
    }

    #[test]
    fn test_password_with_both_quote_kinds() {
        let d = parse(r##"Server=srv;Database=db;User Id=u;Password="both ' and "" ;""##).unwrap();
        assert_eq!(d.password.expose(), "both ' and \" ;");
    }

    #[test]
    fn test_tokenize_ignores_empty_segments() {
        let pairs = tokenize(" ;; a = 1 ; b='x;y' ;").unwrap();
        assert_eq!(
            pairs,
            vec![
                ("a".to_string(), "1".to_string()),
                ("b".to_string(), "x;y".to_string())
            ]
        );
    }
}
