use crate::db::{now_ms, uuid_at};
use crate::error::{ChatError, Result};
use chat_protocol::{Profile, UserView};
use once_cell::sync::Lazy;
use regex::Regex;
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

static USERNAME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z0-9_]{3,20}$").unwrap());

const SEARCH_LIMIT: i64 = 20;

pub(crate) const USER_COLS: &str = "id, username, display_name, avatar_url, online, last_seen";

pub(crate) fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserView> {
    Ok(UserView {
        id: uuid_at(row, 0)?,
        username: row.get(1)?,
        display_name: row.get(2)?,
        avatar_url: row.get(3)?,
        online: row.get::<_, i64>(4)? != 0,
        last_seen: row.get(5)?,
    })
}

/// Lowercase and validate a username.
pub fn normalize_username(input: &str) -> Result<String> {
    let name = input.trim().to_lowercase();
    if !USERNAME_RE.is_match(&name) {
        return Err(ChatError::InvalidInput("invalid_username"));
    }
    Ok(name)
}

/// Register a user record.
pub fn create_user(conn: &Connection, username: &str, display_name: &str) -> Result<UserView> {
    let username = normalize_username(username)?;
    let display_name = match display_name.trim() {
        "" => username.clone(),
        d => d.to_string(),
    };
    let id = Uuid::new_v4();
    let now = now_ms();
    let res = conn.execute(
        "INSERT INTO users (id, username, display_name, last_seen, created_at) VALUES (?1, ?2, ?3, ?4, ?4)",
        params![id.to_string(), username, display_name, now],
    );
    match res {
        Ok(_) => Ok(UserView {
            id,
            username,
            display_name,
            avatar_url: None,
            online: false,
            last_seen: now,
        }),
        Err(e)
            if matches!(
                e.sqlite_error_code(),
                Some(rusqlite::ErrorCode::ConstraintViolation)
            ) =>
        {
            Err(ChatError::InvalidInput("username_taken"))
        }
        Err(e) => Err(e.into()),
    }
}

pub fn get_user(conn: &Connection, id: &Uuid) -> Result<Option<UserView>> {
    let user = conn
        .query_row(
            &format!("SELECT {USER_COLS} FROM users WHERE id = ?1"),
            [id.to_string()],
            row_to_user,
        )
        .optional()?;
    Ok(user)
}

pub fn get_user_by_username(conn: &Connection, username: &str) -> Result<Option<UserView>> {
    let user = conn
        .query_row(
            &format!("SELECT {USER_COLS} FROM users WHERE username = ?1"),
            [username.to_lowercase()],
            row_to_user,
        )
        .optional()?;
    Ok(user)
}

pub fn favorites(conn: &Connection, user_id: &Uuid) -> Result<Vec<Uuid>> {
    let mut stmt =
        conn.prepare("SELECT chat_id FROM favorites WHERE user_id = ?1 ORDER BY rowid")?;
    let ids = stmt
        .query_map([user_id.to_string()], |row| uuid_at(row, 0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}

/// The caller's own account with favorites.
pub fn get_profile(conn: &Connection, user_id: &Uuid) -> Result<Profile> {
    let user = get_user(conn, user_id)?.ok_or(ChatError::NotFound)?;
    Ok(Profile {
        user,
        favorites: favorites(conn, user_id)?,
    })
}

/// Find other users by a case-insensitive substring of username or display name.
pub fn search_users(conn: &Connection, me: &Uuid, search: Option<&str>) -> Result<Vec<UserView>> {
    let term = search.map(str::trim).filter(|s| !s.is_empty());
    if let Some(t) = term {
        if t.chars().count() < 2 {
            return Err(ChatError::InvalidInput("search_too_short"));
        }
    }
    let mut stmt = conn.prepare(&format!(
        "SELECT {USER_COLS} FROM users WHERE id <> ?1 \
         AND (?2 IS NULL OR instr(lower(username), lower(?2)) > 0 OR instr(lower(display_name), lower(?2)) > 0) \
         ORDER BY username LIMIT ?3"
    ))?;
    let users = stmt
        .query_map(params![me.to_string(), term, SEARCH_LIMIT], row_to_user)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(users)
}

/// Change username and/or avatar.
pub fn update_profile(
    conn: &Connection,
    user_id: &Uuid,
    username: Option<&str>,
    avatar_url: Option<&str>,
) -> Result<UserView> {
    let username = username.map(normalize_username).transpose()?;
    let avatar_url = match avatar_url.map(str::trim) {
        Some("") => Some(None),
        Some(u) => {
            url::Url::parse(u).map_err(|_| ChatError::InvalidInput("invalid_avatar"))?;
            Some(Some(u.to_string()))
        }
        None => None,
    };
    if let Some(name) = &username {
        let res = conn.execute(
            "UPDATE users SET username = ?2 WHERE id = ?1",
            params![user_id.to_string(), name],
        );
        if let Err(e) = res {
            if matches!(
                e.sqlite_error_code(),
                Some(rusqlite::ErrorCode::ConstraintViolation)
            ) {
                return Err(ChatError::InvalidInput("username_taken"));
            }
            return Err(e.into());
        }
    }
    if let Some(avatar) = avatar_url {
        conn.execute(
            "UPDATE users SET avatar_url = ?2 WHERE id = ?1",
            params![user_id.to_string(), avatar],
        )?;
    }
    get_user(conn, user_id)?.ok_or(ChatError::NotFound)
}

/// Persist an online/offline transition.
pub fn set_presence(conn: &Connection, user_id: &Uuid, online: bool, at: i64) -> Result<()> {
    conn.execute(
        "UPDATE users SET online = ?2, last_seen = ?3 WHERE id = ?1",
        params![user_id.to_string(), online as i64, at],
    )?;
    Ok(())
}

/// Flip a chat in or out of the user's favorites, returning the new set.
pub fn toggle_favorite(conn: &Connection, user_id: &Uuid, chat_id: &Uuid) -> Result<Vec<Uuid>> {
    if !crate::chats::is_member(conn, chat_id, user_id)? {
        return Err(ChatError::NotFound);
    }
    let removed = conn.execute(
        "DELETE FROM favorites WHERE user_id = ?1 AND chat_id = ?2",
        params![user_id.to_string(), chat_id.to_string()],
    )?;
    if removed == 0 {
        conn.execute(
            "INSERT INTO favorites (user_id, chat_id) VALUES (?1, ?2)",
            params![user_id.to_string(), chat_id.to_string()],
        )?;
    }
    favorites(conn, user_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing;

    #[test]
    fn usernames_are_unique_and_lowercased() {
        let conn = testing::conn();
        let u = create_user(&conn, "Alice", "").unwrap();
        assert_eq!(u.username, "alice");
        assert_eq!(u.display_name, "alice");
        assert!(matches!(
            create_user(&conn, "alice", "Other"),
            Err(ChatError::InvalidInput("username_taken"))
        ));
        assert!(create_user(&conn, "a!", "").is_err());
    }

    #[test]
    fn search_excludes_caller_and_rejects_short_terms() {
        let conn = testing::conn();
        let me = create_user(&conn, "alice", "Alice").unwrap();
        create_user(&conn, "bob", "Bobby").unwrap();
        create_user(&conn, "carol", "Carol").unwrap();
        assert_eq!(search_users(&conn, &me.id, None).unwrap().len(), 2);
        let found = search_users(&conn, &me.id, Some("BOB")).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].username, "bob");
        assert!(search_users(&conn, &me.id, Some("al")).unwrap().is_empty());
        assert!(matches!(
            search_users(&conn, &me.id, Some("b")),
            Err(ChatError::InvalidInput("search_too_short"))
        ));
    }

    #[test]
    fn profile_update_and_presence() {
        let conn = testing::conn();
        let me = create_user(&conn, "alice", "Alice").unwrap();
        create_user(&conn, "bob", "Bob").unwrap();
        assert!(update_profile(&conn, &me.id, Some("bob"), None).is_err());
        let u = update_profile(&conn, &me.id, Some("alicia"), Some("https://img/a.png")).unwrap();
        assert_eq!(u.username, "alicia");
        assert_eq!(u.avatar_url.as_deref(), Some("https://img/a.png"));
        set_presence(&conn, &me.id, true, 42).unwrap();
        let u = get_user(&conn, &me.id).unwrap().unwrap();
        assert!(u.online);
        assert_eq!(u.last_seen, 42);
    }
}
