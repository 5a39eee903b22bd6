use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Pool, Postgres};
use uuid::Uuid;

use super::*;

const USER_COLS: &str = "id, email, name, password_hash, system_account, is_superuser, confirmed, confirmed_time, created_time, \
    signup_ip, signup_country, signup_host, banned, banned_time, locked, locked_time, federated_idp, federated_sso, \
    federated_id, website_url, lang_id, secret_token, failed_login_attempts, last_login, has_avatar";

const DOMAIN_COLS: &str = "id, host, name, is_https, is_readonly, created_time, auth_anonymous, auth_local, auth_sso, sso_url, \
    sso_secret, sso_non_interactive, mod_anonymous, mod_authenticated, mod_num_comments, mod_user_age_days, mod_links, \
    mod_images, mod_notify_policy, default_sort, count_comments, count_views";

const COMMENT_COLS: &str = "id, parent_id, page_id, markdown, html, score, is_pending, is_approved, is_spam, is_deleted, \
    pending_reason, created_time, moderated_time, deleted_time, edited_time, user_created, user_moderated, user_deleted, \
    user_edited, author_name, author_ip";

fn map_err(e: sqlx::Error) -> RepoError {
    match e {
        sqlx::Error::RowNotFound => RepoError::NotFound,
        sqlx::Error::Database(db) if db.code().as_deref() == Some("23505") => RepoError::Conflict,
        sqlx::Error::Database(db) if db.code().as_deref() == Some("23503") => RepoError::NotFound,
        other => RepoError::Internal(other.to_string()),
    }
}

fn affected(n: u64) -> RepoResult<()> {
    if n == 0 {
        Err(RepoError::NotFound)
    } else {
        Ok(())
    }
}

#[derive(Clone)]
pub struct PgRepo {
    pool: Pool<Postgres>,
}

impl PgRepo {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    /// Applies the bundled migrations.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl UserRepo for PgRepo {
    async fn find_user_by_id(&self, id: Id) -> RepoResult<User> {
        sqlx::query_as::<_, User>(&format!("SELECT {USER_COLS} FROM cm_users WHERE id = $1"))
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .map_err(map_err)
    }

    async fn find_user_by_email(&self, email: &str) -> RepoResult<User> {
        sqlx::query_as::<_, User>(&format!("SELECT {USER_COLS} FROM cm_users WHERE email = $1 AND NOT system_account"))
            .bind(email.trim().to_lowercase())
            .fetch_one(&self.pool)
            .await
            .map_err(map_err)
    }

    async fn find_user_by_federated_id(&self, idp: &str, federated_id: &str) -> RepoResult<User> {
        sqlx::query_as::<_, User>(&format!("SELECT {USER_COLS} FROM cm_users WHERE federated_idp = $1 AND federated_id = $2"))
            .bind(idp)
            .bind(federated_id)
            .fetch_one(&self.pool)
            .await
            .map_err(map_err)
    }

    async fn find_user_by_secret_token(&self, token: Uuid) -> RepoResult<User> {
        sqlx::query_as::<_, User>(&format!("SELECT {USER_COLS} FROM cm_users WHERE secret_token = $1 AND NOT system_account"))
            .bind(token)
            .fetch_one(&self.pool)
            .await
            .map_err(map_err)
    }

    async fn find_users_by_ids(&self, ids: &[Id]) -> RepoResult<Vec<User>> {
        sqlx::query_as::<_, User>(&format!("SELECT {USER_COLS} FROM cm_users WHERE id = ANY($1)"))
            .bind(ids)
            .fetch_all(&self.pool)
            .await
            .map_err(map_err)
    }

    async fn list_users(&self, filter: &str) -> RepoResult<Vec<User>> {
        let pattern = format!("%{}%", filter.to_lowercase());
        sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLS} FROM cm_users WHERE NOT system_account AND (email LIKE $1 OR lower(name) LIKE $1) ORDER BY email"
        ))
        .bind(pattern)
        .fetch_all(&self.pool)
        .await
        .map_err(map_err)
    }

    async fn create_user(&self, u: &User) -> RepoResult<()> {
        sqlx::query(&format!(
            "INSERT INTO cm_users ({USER_COLS}) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17,$18,$19,$20,$21,$22,$23,$24,$25)"
        ))
        .bind(u.id)
        .bind(&u.email)
        .bind(&u.name)
        .bind(&u.password_hash)
        .bind(u.system_account)
        .bind(u.is_superuser)
        .bind(u.confirmed)
        .bind(u.confirmed_time)
        .bind(u.created_time)
        .bind(&u.signup_ip)
        .bind(&u.signup_country)
        .bind(&u.signup_host)
        .bind(u.banned)
        .bind(u.banned_time)
        .bind(u.locked)
        .bind(u.locked_time)
        .bind(&u.federated_idp)
        .bind(u.federated_sso)
        .bind(&u.federated_id)
        .bind(&u.website_url)
        .bind(&u.lang_id)
        .bind(u.secret_token)
        .bind(u.failed_login_attempts)
        .bind(u.last_login)
        .bind(u.has_avatar)
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(())
    }

    async fn update_user(&self, u: &User) -> RepoResult<()> {
        let res = sqlx::query(
            "UPDATE cm_users SET email=$2, name=$3, password_hash=$4, is_superuser=$5, confirmed=$6, confirmed_time=$7, \
             banned=$8, banned_time=$9, locked=$10, locked_time=$11, federated_idp=$12, federated_sso=$13, federated_id=$14, \
             website_url=$15, lang_id=$16, secret_token=$17, failed_login_attempts=$18, last_login=$19, has_avatar=$20 \
             WHERE id=$1",
        )
        .bind(u.id)
        .bind(&u.email)
        .bind(&u.name)
        .bind(&u.password_hash)
        .bind(u.is_superuser)
        .bind(u.confirmed)
        .bind(u.confirmed_time)
        .bind(u.banned)
        .bind(u.banned_time)
        .bind(u.locked)
        .bind(u.locked_time)
        .bind(&u.federated_idp)
        .bind(u.federated_sso)
        .bind(&u.federated_id)
        .bind(&u.website_url)
        .bind(&u.lang_id)
        .bind(u.secret_token)
        .bind(u.failed_login_attempts)
        .bind(u.last_login)
        .bind(u.has_avatar)
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        affected(res.rows_affected())
    }

    async fn delete_user(&self, id: Id) -> RepoResult<()> {
        let mut tx = self.pool.begin().await.map_err(map_err)?;
        sqlx::query(
            "UPDATE cm_comments c SET score = c.score - v.direction FROM cm_comment_votes v \
             WHERE v.comment_id = c.id AND v.user_id = $1",
        )
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(map_err)?;
        let res = sqlx::query("DELETE FROM cm_users WHERE id = $1").bind(id).execute(&mut *tx).await.map_err(map_err)?;
        affected(res.rows_affected())?;
        tx.commit().await.map_err(map_err)
    }

    async fn count_superusers(&self) -> RepoResult<i64> {
        sqlx::query_scalar("SELECT count(*) FROM cm_users WHERE is_superuser AND NOT banned")
            .fetch_one(&self.pool)
            .await
            .map_err(map_err)
    }
}

#[async_trait]
impl SessionRepo for PgRepo {
    async fn create_user_session(&self, s: &UserSession) -> RepoResult<()> {
        sqlx::query(
            "INSERT INTO cm_user_sessions (id, user_id, created_time, expires_time, host, proto, ip, country, \
             browser_name, browser_version, os_name, os_version, device) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13)",
        )
        .bind(s.id)
        .bind(s.user_id)
        .bind(s.created_time)
        .bind(s.expires_time)
        .bind(&s.host)
        .bind(&s.proto)
        .bind(&s.ip)
        .bind(&s.country)
        .bind(&s.browser_name)
        .bind(&s.browser_version)
        .bind(&s.os_name)
        .bind(&s.os_version)
        .bind(&s.device)
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(())
    }

    async fn find_user_session(&self, id: Id) -> RepoResult<UserSession> {
        sqlx::query_as::<_, UserSession>("SELECT * FROM cm_user_sessions WHERE id = $1")
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .map_err(map_err)
    }

    async fn delete_user_session(&self, id: Id) -> RepoResult<()> {
        sqlx::query("DELETE FROM cm_user_sessions WHERE id = $1").bind(id).execute(&self.pool).await.map_err(map_err)?;
        Ok(())
    }

    async fn expire_user_sessions(&self, user_id: Id) -> RepoResult<u64> {
        let res = sqlx::query("UPDATE cm_user_sessions SET expires_time = now() WHERE user_id = $1 AND expires_time > now()")
            .bind(user_id)
            .execute(&self.pool)
            .await
            .map_err(map_err)?;
        Ok(res.rows_affected())
    }
}

#[async_trait]
impl TokenRepo for PgRepo {
    async fn create_token(&self, t: &Token) -> RepoResult<()> {
        sqlx::query("INSERT INTO cm_tokens (value, owner, scope, expires_time, multi_use) VALUES ($1,$2,$3,$4,$5)")
            .bind(&t.value)
            .bind(t.owner)
            .bind(t.scope.as_str())
            .bind(t.expires_time)
            .bind(t.multi_use)
            .execute(&self.pool)
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn find_token(&self, value: &str) -> RepoResult<Token> {
        sqlx::query_as::<_, Token>("SELECT value, owner, scope, expires_time, multi_use FROM cm_tokens WHERE value = $1")
            .bind(value)
            .fetch_one(&self.pool)
            .await
            .map_err(map_err)
    }

    async fn update_token(&self, t: &Token) -> RepoResult<()> {
        let res = sqlx::query("UPDATE cm_tokens SET owner=$2, scope=$3, expires_time=$4, multi_use=$5 WHERE value=$1")
            .bind(&t.value)
            .bind(t.owner)
            .bind(t.scope.as_str())
            .bind(t.expires_time)
            .bind(t.multi_use)
            .execute(&self.pool)
            .await
            .map_err(map_err)?;
        affected(res.rows_affected())
    }

    async fn delete_token(&self, value: &str) -> RepoResult<()> {
        sqlx::query("DELETE FROM cm_tokens WHERE value = $1").bind(value).execute(&self.pool).await.map_err(map_err)?;
        Ok(())
    }

    async fn take_token(&self, value: &str, scope: TokenScope) -> RepoResult<Token> {
        let mut tx = self.pool.begin().await.map_err(map_err)?;
        let token = sqlx::query_as::<_, Token>(
            "SELECT value, owner, scope, expires_time, multi_use FROM cm_tokens WHERE value = $1 AND scope = $2 FOR UPDATE",
        )
        .bind(value)
        .bind(scope.as_str())
        .fetch_one(&mut *tx)
        .await
        .map_err(map_err)?;
        if !token.multi_use {
            sqlx::query("DELETE FROM cm_tokens WHERE value = $1").bind(value).execute(&mut *tx).await.map_err(map_err)?;
        }
        tx.commit().await.map_err(map_err)?;
        Ok(token)
    }
}

#[async_trait]
impl AuthSessionRepo for PgRepo {
    async fn create_auth_session(&self, s: &AuthSession) -> RepoResult<()> {
        sqlx::query(
            "INSERT INTO cm_auth_sessions (id, token_value, host, session_data, created_time, expires_time) VALUES ($1,$2,$3,$4,$5,$6)",
        )
        .bind(s.id)
        .bind(&s.token_value)
        .bind(&s.host)
        .bind(&s.session_data)
        .bind(s.created_time)
        .bind(s.expires_time)
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(())
    }

    async fn take_auth_session(&self, id: Id) -> RepoResult<AuthSession> {
        sqlx::query_as::<_, AuthSession>("DELETE FROM cm_auth_sessions WHERE id = $1 RETURNING *")
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .map_err(map_err)
    }
}

#[async_trait]
impl DomainRepo for PgRepo {
    async fn list_domains(&self) -> RepoResult<Vec<Domain>> {
        sqlx::query_as::<_, Domain>(&format!("SELECT {DOMAIN_COLS} FROM cm_domains ORDER BY host"))
            .fetch_all(&self.pool)
            .await
            .map_err(map_err)
    }

    async fn list_user_domains(&self, user_id: Id) -> RepoResult<Vec<(Domain, DomainUser)>> {
        let domains = sqlx::query_as::<_, Domain>(&format!(
            "SELECT {DOMAIN_COLS} FROM cm_domains WHERE id IN (SELECT domain_id FROM cm_domains_users WHERE user_id = $1) ORDER BY host"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_err)?;
        let dus = sqlx::query_as::<_, DomainUser>("SELECT * FROM cm_domains_users WHERE user_id = $1")
            .bind(user_id)
            .fetch_all(&self.pool)
            .await
            .map_err(map_err)?;
        Ok(domains
            .into_iter()
            .filter_map(|d| dus.iter().find(|du| du.domain_id == d.id).cloned().map(|du| (d, du)))
            .collect())
    }

    async fn find_domain_by_id(&self, id: Id) -> RepoResult<Domain> {
        sqlx::query_as::<_, Domain>(&format!("SELECT {DOMAIN_COLS} FROM cm_domains WHERE id = $1"))
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .map_err(map_err)
    }

    async fn find_domain_by_host(&self, host: &str) -> RepoResult<Domain> {
        sqlx::query_as::<_, Domain>(&format!("SELECT {DOMAIN_COLS} FROM cm_domains WHERE host = $1"))
            .bind(host)
            .fetch_one(&self.pool)
            .await
            .map_err(map_err)
    }

    async fn create_domain(&self, d: &Domain, owner: &DomainUser, idps: &[String]) -> RepoResult<()> {
        let mut tx = self.pool.begin().await.map_err(map_err)?;
        sqlx::query(&format!(
            "INSERT INTO cm_domains ({DOMAIN_COLS}) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17,$18,$19,$20,0,0)"
        ))
        .bind(d.id)
        .bind(&d.host)
        .bind(&d.name)
        .bind(d.is_https)
        .bind(d.is_readonly)
        .bind(d.created_time)
        .bind(d.auth_anonymous)
        .bind(d.auth_local)
        .bind(d.auth_sso)
        .bind(&d.sso_url)
        .bind(&d.sso_secret)
        .bind(d.sso_non_interactive)
        .bind(d.mod_anonymous)
        .bind(d.mod_authenticated)
        .bind(d.mod_num_comments)
        .bind(d.mod_user_age_days)
        .bind(d.mod_links)
        .bind(d.mod_images)
        .bind(d.mod_notify_policy.as_str())
        .bind(&d.default_sort)
        .execute(&mut *tx)
        .await
        .map_err(map_err)?;
        insert_domain_user(&mut tx, owner).await?;
        for idp in idps {
            sqlx::query("INSERT INTO cm_domains_idps (domain_id, fed_idp) VALUES ($1, $2)")
                .bind(d.id)
                .bind(idp)
                .execute(&mut *tx)
                .await
                .map_err(map_err)?;
        }
        tx.commit().await.map_err(map_err)
    }

    async fn update_domain(&self, d: &Domain) -> RepoResult<()> {
        let res = sqlx::query(
            "UPDATE cm_domains SET host=$2, name=$3, is_https=$4, is_readonly=$5, auth_anonymous=$6, auth_local=$7, auth_sso=$8, \
             sso_url=$9, sso_secret=$10, sso_non_interactive=$11, mod_anonymous=$12, mod_authenticated=$13, mod_num_comments=$14, \
             mod_user_age_days=$15, mod_links=$16, mod_images=$17, mod_notify_policy=$18, default_sort=$19 WHERE id=$1",
        )
        .bind(d.id)
        .bind(&d.host)
        .bind(&d.name)
        .bind(d.is_https)
        .bind(d.is_readonly)
        .bind(d.auth_anonymous)
        .bind(d.auth_local)
        .bind(d.auth_sso)
        .bind(&d.sso_url)
        .bind(&d.sso_secret)
        .bind(d.sso_non_interactive)
        .bind(d.mod_anonymous)
        .bind(d.mod_authenticated)
        .bind(d.mod_num_comments)
        .bind(d.mod_user_age_days)
        .bind(d.mod_links)
        .bind(d.mod_images)
        .bind(d.mod_notify_policy.as_str())
        .bind(&d.default_sort)
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        affected(res.rows_affected())
    }

    async fn delete_domain(&self, id: Id) -> RepoResult<()> {
        let res = sqlx::query("DELETE FROM cm_domains WHERE id = $1").bind(id).execute(&self.pool).await.map_err(map_err)?;
        affected(res.rows_affected())
    }

    async fn clear_domain(&self, id: Id) -> RepoResult<()> {
        let mut tx = self.pool.begin().await.map_err(map_err)?;
        sqlx::query("DELETE FROM cm_domain_pages WHERE domain_id = $1").bind(id).execute(&mut *tx).await.map_err(map_err)?;
        let res = sqlx::query("UPDATE cm_domains SET count_comments = 0, count_views = 0 WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(map_err)?;
        affected(res.rows_affected())?;
        tx.commit().await.map_err(map_err)
    }

    async fn domain_idps(&self, domain_id: Id) -> RepoResult<Vec<String>> {
        sqlx::query_scalar("SELECT fed_idp FROM cm_domains_idps WHERE domain_id = $1 ORDER BY fed_idp")
            .bind(domain_id)
            .fetch_all(&self.pool)
            .await
            .map_err(map_err)
    }

    async fn set_domain_idps(&self, domain_id: Id, idps: &[String]) -> RepoResult<()> {
        let mut tx = self.pool.begin().await.map_err(map_err)?;
        sqlx::query("DELETE FROM cm_domains_idps WHERE domain_id = $1").bind(domain_id).execute(&mut *tx).await.map_err(map_err)?;
        for idp in idps {
            sqlx::query("INSERT INTO cm_domains_idps (domain_id, fed_idp) VALUES ($1, $2)")
                .bind(domain_id)
                .bind(idp)
                .execute(&mut *tx)
                .await
                .map_err(map_err)?;
        }
        tx.commit().await.map_err(map_err)
    }

    async fn increment_view_counts(&self, domain_id: Id, page_id: Id) -> RepoResult<()> {
        let mut tx = self.pool.begin().await.map_err(map_err)?;
        sqlx::query("UPDATE cm_domain_pages SET count_views = count_views + 1 WHERE id = $1")
            .bind(page_id)
            .execute(&mut *tx)
            .await
            .map_err(map_err)?;
        sqlx::query("UPDATE cm_domains SET count_views = count_views + 1 WHERE id = $1")
            .bind(domain_id)
            .execute(&mut *tx)
            .await
            .map_err(map_err)?;
        tx.commit().await.map_err(map_err)
    }
}

async fn insert_domain_user(tx: &mut sqlx::Transaction<'_, Postgres>, du: &DomainUser) -> RepoResult<()> {
    sqlx::query(
        "INSERT INTO cm_domains_users (domain_id, user_id, is_owner, is_moderator, is_commenter, notify_replies, \
         notify_moderator, notify_comment_status, created_time) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9) \
         ON CONFLICT (domain_id, user_id) DO UPDATE SET is_owner=$3, is_moderator=$4, is_commenter=$5, \
         notify_replies=$6, notify_moderator=$7, notify_comment_status=$8",
    )
    .bind(du.domain_id)
    .bind(du.user_id)
    .bind(du.is_owner)
    .bind(du.is_moderator)
    .bind(du.is_commenter)
    .bind(du.notify_replies)
    .bind(du.notify_moderator)
    .bind(du.notify_comment_status)
    .bind(du.created_time)
    .execute(&mut **tx)
    .await
    .map_err(map_err)?;
    Ok(())
}

#[async_trait]
impl DomainUserRepo for PgRepo {
    async fn find_domain_user(&self, domain_id: Id, user_id: Id) -> RepoResult<DomainUser> {
        sqlx::query_as::<_, DomainUser>("SELECT * FROM cm_domains_users WHERE domain_id = $1 AND user_id = $2")
            .bind(domain_id)
            .bind(user_id)
            .fetch_one(&self.pool)
            .await
            .map_err(map_err)
    }

    async fn upsert_domain_user(&self, du: &DomainUser) -> RepoResult<()> {
        let mut tx = self.pool.begin().await.map_err(map_err)?;
        insert_domain_user(&mut tx, du).await?;
        tx.commit().await.map_err(map_err)
    }

    async fn delete_domain_user(&self, domain_id: Id, user_id: Id) -> RepoResult<()> {
        sqlx::query("DELETE FROM cm_domains_users WHERE domain_id = $1 AND user_id = $2")
            .bind(domain_id)
            .bind(user_id)
            .execute(&self.pool)
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn list_domain_users(&self, domain_id: Id) -> RepoResult<Vec<DomainUser>> {
        sqlx::query_as::<_, DomainUser>("SELECT * FROM cm_domains_users WHERE domain_id = $1 ORDER BY created_time")
            .bind(domain_id)
            .fetch_all(&self.pool)
            .await
            .map_err(map_err)
    }

    async fn count_domain_owners(&self, domain_id: Id) -> RepoResult<i64> {
        sqlx::query_scalar("SELECT count(*) FROM cm_domains_users WHERE domain_id = $1 AND is_owner")
            .bind(domain_id)
            .fetch_one(&self.pool)
            .await
            .map_err(map_err)
    }
}

#[async_trait]
impl PageRepo for PgRepo {
    async fn find_page(&self, id: Id) -> RepoResult<DomainPage> {
        sqlx::query_as::<_, DomainPage>("SELECT * FROM cm_domain_pages WHERE id = $1")
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .map_err(map_err)
    }

    async fn find_page_by_path(&self, domain_id: Id, path: &str) -> RepoResult<DomainPage> {
        sqlx::query_as::<_, DomainPage>("SELECT * FROM cm_domain_pages WHERE domain_id = $1 AND path = $2")
            .bind(domain_id)
            .bind(path)
            .fetch_one(&self.pool)
            .await
            .map_err(map_err)
    }

    async fn get_or_create_page(&self, p: &DomainPage) -> RepoResult<DomainPage> {
        sqlx::query(
            "INSERT INTO cm_domain_pages (id, domain_id, path, title, is_readonly, created_time) VALUES ($1,$2,$3,$4,$5,$6) \
             ON CONFLICT (domain_id, path) DO NOTHING",
        )
        .bind(p.id)
        .bind(p.domain_id)
        .bind(&p.path)
        .bind(&p.title)
        .bind(p.is_readonly)
        .bind(p.created_time)
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        self.find_page_by_path(p.domain_id, &p.path).await
    }

    async fn update_page(&self, p: &DomainPage) -> RepoResult<()> {
        let res = sqlx::query("UPDATE cm_domain_pages SET title = $2, is_readonly = $3 WHERE id = $1")
            .bind(p.id)
            .bind(&p.title)
            .bind(p.is_readonly)
            .execute(&self.pool)
            .await
            .map_err(map_err)?;
        affected(res.rows_affected())
    }

    async fn list_pages(&self, domain_id: Id) -> RepoResult<Vec<DomainPage>> {
        sqlx::query_as::<_, DomainPage>("SELECT * FROM cm_domain_pages WHERE domain_id = $1 ORDER BY path")
            .bind(domain_id)
            .fetch_all(&self.pool)
            .await
            .map_err(map_err)
    }
}

async fn bump_counters(tx: &mut sqlx::Transaction<'_, Postgres>, page_id: Id, delta: i64) -> RepoResult<()> {
    sqlx::query("UPDATE cm_domain_pages SET count_comments = count_comments + $2 WHERE id = $1")
        .bind(page_id)
        .bind(delta)
        .execute(&mut **tx)
        .await
        .map_err(map_err)?;
    sqlx::query(
        "UPDATE cm_domains SET count_comments = count_comments + $2 WHERE id = (SELECT domain_id FROM cm_domain_pages WHERE id = $1)",
    )
    .bind(page_id)
    .bind(delta)
    .execute(&mut **tx)
    .await
    .map_err(map_err)?;
    Ok(())
}

#[async_trait]
impl CommentRepo for PgRepo {
    async fn find_comment(&self, id: Id) -> RepoResult<Comment> {
        sqlx::query_as::<_, Comment>(&format!("SELECT {COMMENT_COLS} FROM cm_comments WHERE id = $1"))
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .map_err(map_err)
    }

    async fn list_page_comments(&self, page_id: Id) -> RepoResult<Vec<Comment>> {
        sqlx::query_as::<_, Comment>(&format!("SELECT {COMMENT_COLS} FROM cm_comments WHERE page_id = $1 ORDER BY created_time"))
            .bind(page_id)
            .fetch_all(&self.pool)
            .await
            .map_err(map_err)
    }

    async fn list_domain_comments(&self, domain_id: Id) -> RepoResult<Vec<Comment>> {
        sqlx::query_as::<_, Comment>(&format!(
            "SELECT {COMMENT_COLS} FROM cm_comments WHERE page_id IN (SELECT id FROM cm_domain_pages WHERE domain_id = $1) \
             ORDER BY created_time"
        ))
        .bind(domain_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_err)
    }

    async fn insert_comment(&self, c: &Comment) -> RepoResult<()> {
        let mut tx = self.pool.begin().await.map_err(map_err)?;
        sqlx::query(&format!(
            "INSERT INTO cm_comments ({COMMENT_COLS}) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17,$18,$19,$20,$21)"
        ))
        .bind(c.id)
        .bind(c.parent_id)
        .bind(c.page_id)
        .bind(&c.markdown)
        .bind(&c.html)
        .bind(c.score)
        .bind(c.is_pending)
        .bind(c.is_approved)
        .bind(c.is_spam)
        .bind(c.is_deleted)
        .bind(&c.pending_reason)
        .bind(c.created_time)
        .bind(c.moderated_time)
        .bind(c.deleted_time)
        .bind(c.edited_time)
        .bind(c.user_created)
        .bind(c.user_moderated)
        .bind(c.user_deleted)
        .bind(c.user_edited)
        .bind(&c.author_name)
        .bind(&c.author_ip)
        .execute(&mut *tx)
        .await
        .map_err(map_err)?;
        if !c.is_deleted {
            bump_counters(&mut tx, c.page_id, 1).await?;
        }
        tx.commit().await.map_err(map_err)
    }

    async fn update_comment(&self, c: &Comment) -> RepoResult<()> {
        let mut tx = self.pool.begin().await.map_err(map_err)?;
        let was_deleted: bool = sqlx::query_scalar("SELECT is_deleted FROM cm_comments WHERE id = $1 FOR UPDATE")
            .bind(c.id)
            .fetch_one(&mut *tx)
            .await
            .map_err(map_err)?;
        sqlx::query(
            "UPDATE cm_comments SET markdown=$2, html=$3, is_pending=$4, is_approved=$5, is_spam=$6, is_deleted=$7, \
             pending_reason=$8, moderated_time=$9, deleted_time=$10, edited_time=$11, user_moderated=$12, user_deleted=$13, \
             user_edited=$14 WHERE id=$1",
        )
        .bind(c.id)
        .bind(&c.markdown)
        .bind(&c.html)
        .bind(c.is_pending)
        .bind(c.is_approved)
        .bind(c.is_spam)
        .bind(c.is_deleted)
        .bind(&c.pending_reason)
        .bind(c.moderated_time)
        .bind(c.deleted_time)
        .bind(c.edited_time)
        .bind(c.user_moderated)
        .bind(c.user_deleted)
        .bind(c.user_edited)
        .execute(&mut *tx)
        .await
        .map_err(map_err)?;
        match (was_deleted, c.is_deleted) {
            (false, true) => bump_counters(&mut tx, c.page_id, -1).await?,
            (true, false) => bump_counters(&mut tx, c.page_id, 1).await?,
            _ => {}
        }
        tx.commit().await.map_err(map_err)
    }

    async fn count_approved_comments(&self, domain_id: Id, user_id: Id) -> RepoResult<i64> {
        sqlx::query_scalar(
            "SELECT count(*) FROM cm_comments c JOIN cm_domain_pages p ON p.id = c.page_id \
             WHERE p.domain_id = $1 AND c.user_created = $2 AND c.is_approved AND NOT c.is_deleted",
        )
        .bind(domain_id)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await
        .map_err(map_err)
    }

    async fn delete_user_comments(&self, user_id: Id, deleted_by: Id, at: DateTime<Utc>) -> RepoResult<u64> {
        let mut tx = self.pool.begin().await.map_err(map_err)?;
        let pages: Vec<(Id, i64)> = sqlx::query_as(
            "SELECT page_id, count(*) FROM cm_comments WHERE user_created = $1 AND NOT is_deleted GROUP BY page_id",
        )
        .bind(user_id)
        .fetch_all(&mut *tx)
        .await
        .map_err(map_err)?;
        let res = sqlx::query(
            "UPDATE cm_comments SET is_deleted = TRUE, deleted_time = $3, user_deleted = $2 WHERE user_created = $1 AND NOT is_deleted",
        )
        .bind(user_id)
        .bind(deleted_by)
        .bind(at)
        .execute(&mut *tx)
        .await
        .map_err(map_err)?;
        for (page_id, n) in pages {
            bump_counters(&mut tx, page_id, -n).await?;
        }
        tx.commit().await.map_err(map_err)?;
        Ok(res.rows_affected())
    }

    async fn purge_comments(&self, domain_id: Id, deleted: bool, user_deleted: bool) -> RepoResult<u64> {
        let mut tx = self.pool.begin().await.map_err(map_err)?;
        let pages: Vec<(Id, i64)> = sqlx::query_as(
            "SELECT c.page_id, count(*) FROM cm_comments c JOIN cm_domain_pages p ON p.id = c.page_id \
             WHERE p.domain_id = $1 AND NOT c.is_deleted AND $2 AND c.user_created IS NULL GROUP BY c.page_id",
        )
        .bind(domain_id)
        .bind(user_deleted)
        .fetch_all(&mut *tx)
        .await
        .map_err(map_err)?;
        let res = sqlx::query(
            "DELETE FROM cm_comments WHERE page_id IN (SELECT id FROM cm_domain_pages WHERE domain_id = $1) \
             AND (($2 AND is_deleted) OR ($3 AND user_created IS NULL))",
        )
        .bind(domain_id)
        .bind(deleted)
        .bind(user_deleted)
        .execute(&mut *tx)
        .await
        .map_err(map_err)?;
        for (page_id, n) in pages {
            bump_counters(&mut tx, page_id, -n).await?;
        }
        tx.commit().await.map_err(map_err)?;
        Ok(res.rows_affected())
    }
}

#[async_trait]
impl VoteRepo for PgRepo {
    async fn find_vote(&self, comment_id: Id, user_id: Id) -> RepoResult<Vote> {
        sqlx::query_as::<_, Vote>("SELECT * FROM cm_comment_votes WHERE comment_id = $1 AND user_id = $2")
            .bind(comment_id)
            .bind(user_id)
            .fetch_one(&self.pool)
            .await
            .map_err(map_err)
    }

    async fn list_page_votes(&self, page_id: Id, user_id: Id) -> RepoResult<Vec<Vote>> {
        sqlx::query_as::<_, Vote>(
            "SELECT v.* FROM cm_comment_votes v JOIN cm_comments c ON c.id = v.comment_id WHERE c.page_id = $1 AND v.user_id = $2",
        )
        .bind(page_id)
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_err)
    }

    async fn set_vote(&self, comment_id: Id, user_id: Id, direction: i16) -> RepoResult<i32> {
        let mut tx = self.pool.begin().await.map_err(map_err)?;
        // Locks the comment row so concurrent votes serialise
        sqlx::query("SELECT id FROM cm_comments WHERE id = $1 FOR UPDATE")
            .bind(comment_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(map_err)?;
        let old: Option<i16> = sqlx::query_scalar("SELECT direction FROM cm_comment_votes WHERE comment_id = $1 AND user_id = $2")
            .bind(comment_id)
            .bind(user_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(map_err)?;
        if direction == 0 {
            sqlx::query("DELETE FROM cm_comment_votes WHERE comment_id = $1 AND user_id = $2")
                .bind(comment_id)
                .bind(user_id)
                .execute(&mut *tx)
                .await
                .map_err(map_err)?;
        } else {
            sqlx::query(
                "INSERT INTO cm_comment_votes (comment_id, user_id, direction, updated_time) VALUES ($1,$2,$3,now()) \
                 ON CONFLICT (comment_id, user_id) DO UPDATE SET direction = $3, updated_time = now()",
            )
            .bind(comment_id)
            .bind(user_id)
            .bind(direction)
            .execute(&mut *tx)
            .await
            .map_err(map_err)?;
        }
        let delta = (direction - old.unwrap_or(0)) as i32;
        let score: i32 = sqlx::query_scalar("UPDATE cm_comments SET score = score + $2 WHERE id = $1 RETURNING score")
            .bind(comment_id)
            .bind(delta)
            .fetch_one(&mut *tx)
            .await
            .map_err(map_err)?;
        tx.commit().await.map_err(map_err)?;
        Ok(score)
    }
}

#[async_trait]
impl ConfigRepo for PgRepo {
    async fn load_instance_config(&self) -> RepoResult<Vec<ConfigRow>> {
        sqlx::query_as::<_, ConfigRow>("SELECT key, value, updated_time, user_updated FROM cm_configuration")
            .fetch_all(&self.pool)
            .await
            .map_err(map_err)
    }

    async fn save_instance_config(&self, rows: &[ConfigRow]) -> RepoResult<()> {
        let mut tx = self.pool.begin().await.map_err(map_err)?;
        for r in rows {
            sqlx::query(
                "INSERT INTO cm_configuration (key, value, updated_time, user_updated) VALUES ($1,$2,$3,$4) \
                 ON CONFLICT (key) DO UPDATE SET value = $2, updated_time = $3, user_updated = $4",
            )
            .bind(&r.key)
            .bind(&r.value)
            .bind(r.updated_time)
            .bind(r.user_updated)
            .execute(&mut *tx)
            .await
            .map_err(map_err)?;
        }
        tx.commit().await.map_err(map_err)
    }

    async fn delete_instance_config(&self) -> RepoResult<()> {
        sqlx::query("DELETE FROM cm_configuration").execute(&self.pool).await.map_err(map_err)?;
        Ok(())
    }

    async fn load_domain_config(&self, domain_id: Id) -> RepoResult<Vec<ConfigRow>> {
        sqlx::query_as::<_, ConfigRow>(
            "SELECT key, value, updated_time, user_updated FROM cm_domain_configuration WHERE domain_id = $1",
        )
        .bind(domain_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_err)
    }

    async fn save_domain_config(&self, domain_id: Id, rows: &[ConfigRow]) -> RepoResult<()> {
        let mut tx = self.pool.begin().await.map_err(map_err)?;
        for r in rows {
            sqlx::query(
                "INSERT INTO cm_domain_configuration (domain_id, key, value, updated_time, user_updated) VALUES ($1,$2,$3,$4,$5) \
                 ON CONFLICT (domain_id, key) DO UPDATE SET value = $3, updated_time = $4, user_updated = $5",
            )
            .bind(domain_id)
            .bind(&r.key)
            .bind(&r.value)
            .bind(r.updated_time)
            .bind(r.user_updated)
            .execute(&mut *tx)
            .await
            .map_err(map_err)?;
        }
        tx.commit().await.map_err(map_err)
    }

    async fn delete_domain_config(&self, domain_id: Id) -> RepoResult<()> {
        sqlx::query("DELETE FROM cm_domain_configuration WHERE domain_id = $1")
            .bind(domain_id)
            .execute(&self.pool)
            .await
            .map_err(map_err)?;
        Ok(())
    }
}

#[async_trait]
impl MaintenanceRepo for PgRepo {
    async fn prune_expired(&self, now: DateTime<Utc>) -> RepoResult<PruneStats> {
        let tokens = sqlx::query("DELETE FROM cm_tokens WHERE expires_time <= $1").bind(now).execute(&self.pool).await.map_err(map_err)?;
        let auth = sqlx::query("DELETE FROM cm_auth_sessions WHERE expires_time <= $1").bind(now).execute(&self.pool).await.map_err(map_err)?;
        let sessions = sqlx::query("DELETE FROM cm_user_sessions WHERE expires_time <= $1").bind(now).execute(&self.pool).await.map_err(map_err)?;
        Ok(PruneStats { tokens: tokens.rows_affected(), auth_sessions: auth.rows_affected(), user_sessions: sessions.rows_affected() })
    }
}
