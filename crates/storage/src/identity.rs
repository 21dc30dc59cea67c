use std::fmt;
use std::str::FromStr;

use snafu::{Snafu, ensure};

/// Characters the remote store refuses inside keys.
const KEY_DELIMITERS: [char; 2] = ['.', '@'];
const KEY_DELIMITER_REPLACEMENT: char = '-';
const MAIL_ALIAS_DELIMITER: char = '+';
/// Characters that would change the meaning of a store path.
const FORBIDDEN_KEY_CHARACTERS: [char; 5] = ['/', '#', '$', '[', ']'];

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum IdentityError {
    #[snafu(display("user identity '{raw}' is blank after canonicalization"))]
    BlankIdentity { stage: &'static str, raw: String },
    #[snafu(display("user identity '{raw}' contains forbidden character {character:?}"))]
    ForbiddenCharacter {
        stage: &'static str,
        raw: String,
        character: char,
    },
}

/// Canonical lookup key for one signed-in account.
///
/// The same account is often spelled differently at the UI boundary
/// (`A@X.com`, ` a+work@x.com `), so every identity is folded into one key
/// before it reaches the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UserIdentity(String);

impl UserIdentity {
    pub fn parse(raw: &str) -> Result<Self, IdentityError> {
        let key = canonical_key(raw);
        ensure!(
            !key.is_empty(),
            BlankIdentitySnafu {
                stage: "parse-user-identity",
                raw: raw.to_string(),
            }
        );
        if let Some(character) = key
            .chars()
            .find(|character| FORBIDDEN_KEY_CHARACTERS.contains(character) || character.is_control())
        {
            return ForbiddenCharacterSnafu {
                stage: "parse-user-identity",
                raw: raw.to_string(),
                character,
            }
            .fail();
        }
        Ok(Self(key))
    }

    pub fn as_key(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserIdentity {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(&self.0)
    }
}

impl FromStr for UserIdentity {
    type Err = IdentityError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Self::parse(raw)
    }
}

impl AsRef<str> for UserIdentity {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

fn canonical_key(raw: &str) -> String {
    let lowered = raw.trim().to_lowercase();

    let without_alias = match lowered.split_once('@') {
        Some((local, domain)) => {
            let local = local
                .split_once(MAIL_ALIAS_DELIMITER)
                .map_or(local, |(base, _alias)| base);
            format!("{local}@{domain}")
        }
        None => lowered,
    };

    without_alias
        .chars()
        .map(|character| {
            if KEY_DELIMITERS.contains(&character) {
                KEY_DELIMITER_REPLACEMENT
            } else {
                character
            }
        })
        .collect()
}
