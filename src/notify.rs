//! Outgoing mail: the transport seam plus the comment notification fan-out.
//! Fan-out runs detached from the request and never fails it.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{error, info, warn};

use crate::config::AppConfig;
use crate::models::{Comment, Domain, DomainPage, DomainUser, ModNotifyPolicy, User};
use crate::repo::{OptionalExt, Repo};

const DISPATCH_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailKind {
    ConfirmEmail,
    ResetPassword,
    Reply,
    Moderator,
    CommentStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailMessage {
    pub to: String,
    pub kind: MailKind,
    pub subject: String,
    pub body: String,
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, msg: &MailMessage) -> anyhow::Result<()>;
}

/// Logs messages instead of delivering them.
#[derive(Clone, Debug, Default)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, msg: &MailMessage) -> anyhow::Result<()> {
        info!(to = %msg.to, kind = ?msg.kind, subject = %msg.subject, "mail send stub");
        Ok(())
    }
}

/// Captures messages in memory; used by the test harness.
#[derive(Clone, Debug, Default)]
pub struct MemoryMailer {
    sent: Arc<Mutex<Vec<MailMessage>>>,
}

impl MemoryMailer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<MailMessage> {
        self.sent.lock().map(|v| v.clone()).unwrap_or_default()
    }

    pub fn clear(&self) {
        if let Ok(mut v) = self.sent.lock() {
            v.clear();
        }
    }

    /// Polls until at least `n` messages arrived or `timeout` passed.
    pub async fn wait_for(&self, n: usize, timeout: Duration) -> Vec<MailMessage> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let msgs = self.messages();
            if msgs.len() >= n || tokio::time::Instant::now() >= deadline {
                return msgs;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

#[async_trait]
impl Mailer for MemoryMailer {
    async fn send(&self, msg: &MailMessage) -> anyhow::Result<()> {
        self.sent.lock().map_err(|_| anyhow::anyhow!("mailer lock poisoned"))?.push(msg.clone());
        Ok(())
    }
}

struct Strings {
    confirm_subject: &'static str,
    confirm_body: &'static str,
    reset_subject: &'static str,
    reset_body: &'static str,
    reply_subject: &'static str,
    moderator_subject: &'static str,
    moderator_pending: &'static str,
    status_approved: &'static str,
    status_rejected: &'static str,
    moderate_link: &'static str,
    unsubscribe: &'static str,
}

const EN: Strings = Strings {
    confirm_subject: "Confirm your email address",
    confirm_body: "Please confirm your email address by following this link:",
    reset_subject: "Reset your password",
    reset_body: "A password reset was requested for your account. Follow this link to choose a new password:",
    reply_subject: "New reply to your comment",
    moderator_subject: "New comment on",
    moderator_pending: "This comment is awaiting moderation.",
    status_approved: "Your comment has been approved",
    status_rejected: "Your comment has been rejected",
    moderate_link: "Moderate:",
    unsubscribe: "Unsubscribe:",
};

const DE: Strings = Strings {
    confirm_subject: "Bestätigen Sie Ihre E-Mail-Adresse",
    confirm_body: "Bitte bestätigen Sie Ihre E-Mail-Adresse über diesen Link:",
    reset_subject: "Passwort zurücksetzen",
    reset_body: "Für Ihr Konto wurde ein neues Passwort angefordert. Über diesen Link können Sie es festlegen:",
    reply_subject: "Neue Antwort auf Ihren Kommentar",
    moderator_subject: "Neuer Kommentar auf",
    moderator_pending: "Dieser Kommentar wartet auf Moderation.",
    status_approved: "Ihr Kommentar wurde freigegeben",
    status_rejected: "Ihr Kommentar wurde abgelehnt",
    moderate_link: "Moderieren:",
    unsubscribe: "Abbestellen:",
};

fn strings(lang: &str) -> Option<&'static Strings> {
    match lang {
        "en" => Some(&EN),
        "de" => Some(&DE),
        _ => None,
    }
}

/// Recipient's language, then the instance default, then English.
fn strings_for(user: &User, cfg: &AppConfig) -> &'static Strings {
    strings(&user.lang_id).or_else(|| strings(&cfg.default_language)).unwrap_or(&EN)
}

fn excerpt(markdown: &str) -> String {
    let s: String = markdown.chars().take(300).collect();
    if s.len() < markdown.len() {
        format!("{s}…")
    } else {
        s
    }
}

#[derive(Clone)]
pub struct Notifier {
    repo: Arc<dyn Repo>,
    cfg: Arc<AppConfig>,
    mailer: Arc<dyn Mailer>,
}

impl Notifier {
    pub fn new(repo: Arc<dyn Repo>, cfg: Arc<AppConfig>, mailer: Arc<dyn Mailer>) -> Self {
        Self { repo, cfg, mailer }
    }

    pub fn mailer(&self) -> &Arc<dyn Mailer> {
        &self.mailer
    }

    pub async fn send_confirmation(&self, user: &User, token: &str) -> anyhow::Result<()> {
        let s = strings_for(user, &self.cfg);
        let link = format!("{}/api/auth/confirm?token={token}", self.cfg.base_url);
        self.mailer
            .send(&MailMessage {
                to: user.email.clone(),
                kind: MailKind::ConfirmEmail,
                subject: s.confirm_subject.into(),
                body: format!("{}\n\n{link}\n", s.confirm_body),
            })
            .await
    }

    pub async fn send_password_reset(&self, user: &User, token: &str) -> anyhow::Result<()> {
        let s = strings_for(user, &self.cfg);
        let link = format!("{}/{}/auth/reset?token={token}", self.cfg.base_url, self.cfg.default_language);
        self.mailer
            .send(&MailMessage {
                to: user.email.clone(),
                kind: MailKind::ResetPassword,
                subject: s.reset_subject.into(),
                body: format!("{}\n\n{link}\n", s.reset_body),
            })
            .await
    }

    fn unsubscribe_link(&self, user: &User, domain: &Domain, kind: &str) -> String {
        format!(
            "{}/api/mail/unsubscribe?secretToken={}&domain={}&kind={kind}",
            self.cfg.base_url, user.secret_token, domain.id
        )
    }

    fn comment_url(domain: &Domain, page: &DomainPage, comment: &Comment) -> String {
        format!("{}{}#comentario-{}", domain.root_url(), page.path, comment.id)
    }

    async fn deliver(&self, msg: MailMessage) {
        if let Err(e) = self.mailer.send(&msg).await {
            warn!(to = %msg.to, kind = ?msg.kind, error = %e, "notification delivery failed");
        }
    }

    async fn member(&self, domain: &Domain, user_id: crate::models::Id) -> Option<(User, Option<DomainUser>)> {
        let user = match self.repo.find_user_by_id(user_id).await {
            Ok(u) if !u.system_account && !u.banned && !u.email.is_empty() => u,
            Ok(_) => return None,
            Err(e) => {
                warn!(user = %user_id, error = %e, "notification recipient lookup failed");
                return None;
            }
        };
        let du = self.repo.find_domain_user(domain.id, user.id).await.optional().unwrap_or_else(|e| {
            warn!(user = %user.id, error = %e, "membership lookup failed");
            None
        });
        Some((user, du))
    }

    /// Tells the parent comment's author about a reply they are allowed to see.
    pub async fn reply(&self, comment: &Comment, page: &DomainPage, domain: &Domain) {
        let Some(parent_id) = comment.parent_id else { return };
        let parent = match self.repo.find_comment(parent_id).await {
            Ok(p) => p,
            Err(e) => {
                warn!(comment = %comment.id, error = %e, "parent lookup failed");
                return;
            }
        };
        let Some(parent_author) = parent.user_created else { return };
        if parent.is_anonymous() || Some(parent_author) == comment.user_created {
            return;
        }
        let Some((user, du)) = self.member(domain, parent_author).await else { return };
        if !du.as_ref().map(|d| d.notify_replies).unwrap_or(true) {
            return;
        }
        let is_mod = du.as_ref().map(DomainUser::is_moderator_plus).unwrap_or(false) || user.is_superuser;
        // A pending reply is only news to someone who can moderate it
        if comment.is_pending && !is_mod {
            return;
        }
        let s = strings_for(&user, &self.cfg);
        let mut body = format!("{}\n\n{}\n", Self::comment_url(domain, page, comment), excerpt(&comment.markdown));
        if is_mod && comment.is_pending {
            body.push_str(&format!("\n{} {}/{}/manage/domains/{}/comments/{}\n", s.moderate_link, self.cfg.base_url, self.cfg.default_language, domain.id, comment.id));
        }
        body.push_str(&format!("\n{} {}\n", s.unsubscribe, self.unsubscribe_link(&user, domain, "reply")));
        self.deliver(MailMessage { to: user.email.clone(), kind: MailKind::Reply, subject: s.reply_subject.into(), body }).await;
    }

    /// Tells the domain's moderators about a new comment, per the domain policy.
    pub async fn moderators(&self, comment: &Comment, page: &DomainPage, domain: &Domain) {
        match domain.mod_notify_policy {
            ModNotifyPolicy::None => return,
            ModNotifyPolicy::PendingOnly if !comment.is_pending => return,
            _ => {}
        }
        let members = match self.repo.list_domain_users(domain.id).await {
            Ok(m) => m,
            Err(e) => {
                warn!(domain = %domain.id, error = %e, "moderator lookup failed");
                return;
            }
        };
        for du in members.into_iter().filter(|d| d.is_moderator_plus() && d.notify_moderator) {
            if Some(du.user_id) == comment.user_created {
                continue;
            }
            let Some((user, _)) = self.member(domain, du.user_id).await else { continue };
            let s = strings_for(&user, &self.cfg);
            let mut body = format!("{}\n\n{}\n", Self::comment_url(domain, page, comment), excerpt(&comment.markdown));
            if comment.is_pending {
                body.push_str(&format!("\n{}\n", s.moderator_pending));
            }
            body.push_str(&format!("\n{} {}\n", s.unsubscribe, self.unsubscribe_link(&user, domain, "moderator")));
            self.deliver(MailMessage {
                to: user.email.clone(),
                kind: MailKind::Moderator,
                subject: format!("{} {}", s.moderator_subject, domain.host),
                body,
            })
            .await;
        }
    }

    /// Tells the author their pending comment was approved or rejected.
    pub async fn comment_status(&self, comment: &Comment, page: &DomainPage, domain: &Domain) {
        let Some(author) = comment.user_created else { return };
        if comment.is_anonymous() {
            return;
        }
        let Some((user, du)) = self.member(domain, author).await else { return };
        if !du.as_ref().map(|d| d.notify_comment_status).unwrap_or(true) {
            return;
        }
        let s = strings_for(&user, &self.cfg);
        let subject = if comment.is_approved { s.status_approved } else { s.status_rejected };
        let body = format!(
            "{}\n\n{}\n\n{} {}\n",
            Self::comment_url(domain, page, comment),
            excerpt(&comment.markdown),
            s.unsubscribe,
            self.unsubscribe_link(&user, domain, "commentStatus")
        );
        self.deliver(MailMessage { to: user.email.clone(), kind: MailKind::CommentStatus, subject: subject.into(), body }).await;
    }

    fn spawn<F>(&self, what: &'static str, fut: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(async move {
            if tokio::time::timeout(DISPATCH_TIMEOUT, fut).await.is_err() {
                error!(task = what, "notification dispatch timed out");
            }
        });
    }

    /// Fan-out for a freshly submitted comment.
    pub fn comment_submitted(&self, comment: Comment, page: DomainPage, domain: Domain) {
        let me = self.clone();
        self.spawn("comment-submitted", async move {
            me.reply(&comment, &page, &domain).await;
            me.moderators(&comment, &page, &domain).await;
        });
    }

    /// Fan-out for a Pending → Approved/Rejected transition.
    pub fn comment_moderated(&self, comment: Comment, page: DomainPage, domain: Domain) {
        let me = self.clone();
        self.spawn("comment-moderated", async move {
            me.comment_status(&comment, &page, &domain).await;
            if comment.is_approved {
                me.reply(&comment, &page, &domain).await;
            }
        });
    }
}
