use std::env;

use lettre::message::header;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use tracing::{error, info};

/// 发送告警邮件（模式切换、风控熔断等需要"看得见"的事件）
pub async fn send_email(title: &str, body: String) {
    let smtp_server = &env::var("EMAIL_SMTP_SERVER").unwrap_or(String::from("smtp.gmail.com"));

    let from = env::var("EMAIL_FROM").unwrap_or_default();
    let to = env::var("EMAIL_TO").unwrap_or_default();
    if from.is_empty() || to.is_empty() {
        info!("email not configured, skip notification: {}", title);
        return;
    }

    let username = env::var("EMAIL_SEND_USERNAME").unwrap_or_else(|_| from.clone());
    let password = env::var("EMAIL_SEND_PASSWORD").unwrap_or_default();

    let email = match Message::builder()
        .from(from.parse().unwrap())
        .to(to.parse().unwrap())
        .subject(title)
        .header(header::ContentType::TEXT_PLAIN)
        .body(body)
    {
        Ok(m) => m,
        Err(e) => {
            error!("build email error: {:?}", e);
            return;
        }
    };

    let creds = Credentials::new(username, password);
    let mailer = match SmtpTransport::relay(smtp_server) {
        Ok(m) => m.credentials(creds).build(),
        Err(e) => {
            error!("smtp relay error: {:?}", e);
            return;
        }
    };

    // SMTP 为阻塞调用，放到阻塞线程池里执行
    let title = title.to_string();
    tokio::task::spawn_blocking(move || match mailer.send(&email) {
        Ok(_) => info!("notification email sent: {}", title),
        Err(e) => error!("send email error: {:?}", e),
    });
}
