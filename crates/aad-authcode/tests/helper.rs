#![expect(clippy::unwrap_used, reason = "test code can panic on errors")]

use std::cell::Cell;

use aad_authcode::*;
use rstest::rstest;
use url::Url;

fn request() -> AuthorizationRequest {
    AuthorizationRequest {
        endpoint: Url::parse("https://login.microsoftonline.com/common/oauth2/v2.0/authorize").unwrap(),
        client_id: "a85cf173-4192-42f8-81fa-777a763e6e2c".to_owned(),
        scope: "ms-device-service://termsrv.wvd.microsoft.com/name/host/user_impersonation".to_owned(),
        redirect_uri: "ms-appx-web://Microsoft.AAD.BrokerPlugin/a85cf173-4192-42f8-81fa-777a763e6e2c".to_owned(),
    }
}

#[test]
fn authorization_url_carries_the_request() {
    let url = request().authorization_url();

    let pairs = url.query_pairs().into_owned().collect::<Vec<_>>();
    assert_eq!(
        vec![
            ("client_id".to_owned(), request().client_id),
            ("response_type".to_owned(), "code".to_owned()),
            ("scope".to_owned(), request().scope),
            ("redirect_uri".to_owned(), request().redirect_uri),
        ],
        pairs
    );
    assert_eq!("login.microsoftonline.com", url.host_str().unwrap());
}

#[rstest]
#[case("https://localhost/redirect?code=0.AXoA&state=12", Some("0.AXoA"))]
#[case("https://localhost/redirect?state=12&code=abc%20def", Some("abc def"))]
#[case("https://localhost/redirect?code=first&code=second", Some("first"))]
#[case("https://localhost/redirect?code=", None)]
#[case("https://localhost/redirect?error=access_denied", None)]
#[case("https://localhost/redirect", None)]
fn code_extraction(#[case] url: &str, #[case] expected: Option<&str>) {
    let url = Url::parse(url).unwrap();
    assert_eq!(expected.map(str::to_owned), extract_code(&url));
}

struct FixedCode(&'static str);

impl AuthCodeProvider for FixedCode {
    fn authorization_code(&self, _: &str, _: &Url) -> Result<String, AuthCodeError> {
        Ok(self.0.to_owned())
    }
}

#[derive(Default)]
struct CountingExchange {
    calls: Cell<usize>,
}

impl TokenExchange for CountingExchange {
    type Token = String;

    fn exchange(&self, _: &AuthorizationRequest, code: &str) -> Result<String, AuthCodeError> {
        self.calls.set(self.calls.get() + 1);
        Ok(format!("token-for-{code}"))
    }
}

#[test]
fn token_is_acquired_with_the_code() {
    let exchange = CountingExchange::default();

    let token = acquire_token(&FixedCode(" abc \n"), &exchange, &request(), "Sign in").unwrap();

    assert_eq!("token-for-abc", token);
    assert_eq!(1, exchange.calls.get());
}

#[rstest]
#[case("")]
#[case("   ")]
fn empty_code_skips_the_exchange(#[case] code: &'static str) {
    let exchange = CountingExchange::default();

    let error = acquire_token(&FixedCode(code), &exchange, &request(), "Sign in").unwrap_err();

    assert!(matches!(error, AuthCodeError::NoCode));
    assert_eq!(0, exchange.calls.get());
}

#[test]
fn missing_helper_fails_to_spawn() {
    let helper = HelperProcess::new("/nonexistent/aad-helper");
    let url = request().authorization_url();

    let error = helper.authorization_code("Sign in", &url).unwrap_err();
    assert!(matches!(error, AuthCodeError::Spawn { .. }));
}

#[cfg(unix)]
mod unix {
    use super::*;

    fn sh(script: &str) -> HelperProcess {
        HelperProcess::new("sh").arg("-c").arg(script)
    }

    #[test]
    fn first_line_is_the_code() {
        let url = request().authorization_url();

        let code = sh("printf '  0.AXoA  \\nignored\\n'").authorization_code("Sign in", &url).unwrap();

        assert_eq!("0.AXoA", code);
    }

    #[test]
    fn title_and_url_are_passed_last() {
        let url = request().authorization_url();

        // With `sh -c`, the title lands in `$0` and the URL in `$1`.
        let echoed = sh("echo \"$0|$1\"").authorization_code("Sign in", &url).unwrap();

        assert_eq!(format!("Sign in|{url}"), echoed);
    }

    #[test]
    fn non_zero_exit_is_a_failure() {
        let url = request().authorization_url();

        let error = sh("echo code; exit 3").authorization_code("Sign in", &url).unwrap_err();

        assert!(matches!(error, AuthCodeError::HelperFailed { status } if status.code() == Some(3)));
    }

    #[test]
    fn empty_output_is_no_code() {
        let exchange = CountingExchange::default();

        let error = acquire_token(&sh("true"), &exchange, &request(), "Sign in").unwrap_err();

        assert!(matches!(error, AuthCodeError::NoCode));
        assert_eq!(0, exchange.calls.get());
    }
}
