//! Minimal server-rendered pages for the interactive half of the flows:
//! connector chooser, password form, consent, device code entry, and error
//! reporting. Plain HTML, no template engine.

use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};

use crate::connectors::RegisteredConnector;

/// Escape text interpolated into HTML bodies or attribute values.
fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            other => out.push(other),
        }
    }
    out
}

fn layout(title: &str, body: &str) -> Html<String> {
    Html(format!(
        "<!doctype html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n\
         <meta name=\"viewport\" content=\"width=device-width, initial-scale=1\">\n\
         <title>{title}</title>\n</head>\n<body>\n{body}\n</body>\n</html>\n",
        title = escape(title),
    ))
}

/// Rendered for failures that must not redirect anywhere: unknown client,
/// unverified redirect URI, expired login session.
pub fn error_page(status: StatusCode, title: &str, detail: &str) -> Response {
    let body = format!(
        "<h1>{}</h1>\n<p>{}</p>",
        escape(title),
        escape(detail)
    );
    (status, layout(title, &body)).into_response()
}

/// Connector chooser shown when more than one login method is configured.
pub fn connector_chooser(connectors: &[RegisteredConnector], auth_req_id: &str) -> Response {
    let mut items = String::new();
    for connector in connectors {
        items.push_str(&format!(
            "<li><a href=\"/auth/{id}?req={req}\">Log in with {name}</a></li>\n",
            id = escape(&connector.id),
            req = escape(auth_req_id),
            name = escape(&connector.name),
        ));
    }
    let body = format!("<h1>Log in to oxidp</h1>\n<ul>\n{items}</ul>");
    layout("Log in", &body).into_response()
}

/// Username/password form for password-capable connectors.
pub fn password_form(
    connector_id: &str,
    auth_req_id: &str,
    prompt: &str,
    invalid: bool,
) -> Response {
    let error = if invalid {
        "<p>Invalid credentials. Please try again.</p>\n"
    } else {
        ""
    };
    let body = format!(
        "<h1>Log in</h1>\n{error}\
         <form method=\"post\" action=\"/auth/{id}/login?req={req}\">\n\
         <label>{prompt} <input type=\"text\" name=\"login\" autofocus></label><br>\n\
         <label>Password <input type=\"password\" name=\"password\"></label><br>\n\
         <button type=\"submit\">Login</button>\n</form>",
        id = escape(connector_id),
        req = escape(auth_req_id),
        prompt = escape(prompt),
    );
    let status = if invalid {
        StatusCode::UNAUTHORIZED
    } else {
        StatusCode::OK
    };
    (status, layout("Log in", &body)).into_response()
}

/// Consent page listing the client and the requested scopes.
pub fn approval_form(auth_req_id: &str, client_name: &str, scopes: &[String]) -> Response {
    let mut scope_items = String::new();
    for scope in scopes {
        scope_items.push_str(&format!("<li>{}</li>\n", escape(scope)));
    }
    let body = format!(
        "<h1>Grant access</h1>\n\
         <p><b>{client}</b> would like to access:</p>\n<ul>\n{scope_items}</ul>\n\
         <form method=\"post\" action=\"/approval?req={req}\">\n\
         <button type=\"submit\" name=\"approval\" value=\"approve\">Grant access</button>\n\
         <button type=\"submit\" name=\"approval\" value=\"deny\">Deny</button>\n</form>",
        client = escape(client_name),
        req = escape(auth_req_id),
    );
    layout("Grant access", &body).into_response()
}

/// Device flow: user code entry form.
pub fn device_code_form(prefill: &str, invalid: bool) -> Response {
    let error = if invalid {
        "<p>Invalid or expired code. Please try again.</p>\n"
    } else {
        ""
    };
    let body = format!(
        "<h1>Enter the code displayed on your device</h1>\n{error}\
         <form method=\"post\" action=\"/device/auth\">\n\
         <input type=\"text\" name=\"user_code\" value=\"{prefill}\" autofocus>\n\
         <button type=\"submit\">Submit</button>\n</form>",
        prefill = escape(prefill),
    );
    let status = if invalid {
        StatusCode::BAD_REQUEST
    } else {
        StatusCode::OK
    };
    (status, layout("Enter device code", &body)).into_response()
}

/// Device flow: shown once the device has been authorized.
pub fn device_success() -> Response {
    layout(
        "Login successful",
        "<h1>Login successful</h1>\n<p>Return to your device to continue.</p>",
    )
    .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escape_neutralizes_markup() {
        assert_eq!(
            escape("<script>\"&'</script>"),
            "&lt;script&gt;&quot;&amp;&#39;&lt;/script&gt;"
        );
        assert_eq!(escape("plain text"), "plain text");
    }

    #[tokio::test]
    async fn error_page_carries_status_and_detail() {
        let response = error_page(StatusCode::BAD_REQUEST, "Bad request", "missing client_id");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let html = String::from_utf8(body.to_vec()).unwrap();
        assert!(html.contains("missing client_id"));
    }

    #[tokio::test]
    async fn password_form_escapes_interpolations() {
        let response = password_form("local", "<req>", "Email Address", false);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let html = String::from_utf8(body.to_vec()).unwrap();
        assert!(html.contains("req=&lt;req&gt;"));
        assert!(!html.contains("req=<req>"));
    }
}
