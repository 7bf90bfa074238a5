mod common;

use std::sync::atomic::Ordering;

use browser_pilot::AgentConfig;
use browser_pilot::dom::{ElementLocator, FrameSelector};
use browser_pilot::error::BrowserError;
use browser_pilot::session::Session;
use browser_pilot::types::{Action, ActionRecord, Observation};
use common::*;

#[tokio::test]
async fn click_invalidates_the_selector_map() {
    let mut session = Session::new(FakeBrowser::new(), &config());
    let page = session.observe().await.unwrap();
    assert_eq!(page.url, HOME);
    assert_eq!(page.element_count, 3);
    assert!(page.elements.starts_with("[0]<a"));

    let outcome = session.execute(&click(0)).await.unwrap();
    assert!(outcome.observation.success);
    assert!(outcome.observation.page_changed);
    assert_eq!(outcome.observation.url.as_deref(), Some(FORM));
    assert_eq!(outcome.target, Some(ElementLocator::top_level("html > body > a")));

    // index 1 now refers to the form's textarea
    assert_eq!(
        session.locator_at(1).await.unwrap(),
        Some(ElementLocator::top_level("html > body > textarea"))
    );
}

#[tokio::test]
async fn extracted_text_is_bounded() {
    let config = AgentConfig {
        max_result_chars: 5,
        ..config()
    };
    let mut session = Session::new(FakeBrowser::new(), &config);
    let outcome = session
        .execute(&Action::Extract { index: None })
        .await
        .unwrap();
    let content = outcome.observation.content.unwrap();
    assert!(content.starts_with("conte... [truncated"));
    assert!(!outcome.observation.page_changed);
}

#[tokio::test]
async fn replay_targets_the_recorded_locator_not_the_index() {
    let browser = FakeBrowser::new();
    let log = browser.log.clone();
    let mut session = Session::new(browser, &config());
    let record = ActionRecord {
        action: click(99),
        target: Some(ElementLocator::top_level("html > body > button")),
        observation: Observation::succeeded(None),
    };

    let observation = session.replay(&record).await.unwrap();

    assert!(observation.success);
    assert_eq!(*log.lock().unwrap(), vec!["click html > body > button".to_string()]);
}

#[tokio::test]
async fn close_is_idempotent() {
    let browser = FakeBrowser::new();
    let closed = browser.closed.clone();
    let mut session = Session::new(browser, &config());
    session.close().await;
    session.close().await;
    assert!(session.is_closed());
    assert!(closed.load(Ordering::SeqCst));
}

#[tokio::test]
async fn timed_out_typing_is_not_repeated() {
    let config = AgentConfig {
        action_retries: 2,
        ..config()
    };
    // the keystrokes land, then the call reports a timeout
    let browser = FakeBrowser::new().at(FORM).with_faults(vec![Fault::After(
        BrowserError::Timeout("type exceeded 30s".into()),
    )]);
    let log = browser.log.clone();
    let fields = browser.fields.clone();
    let mut session = Session::new(browser, &config);

    let outcome = session
        .execute(&Action::TypeText {
            index: 0,
            text: "gs.print(1);".into(),
        })
        .await
        .unwrap();

    assert!(!outcome.observation.success);
    assert!(outcome.observation.error.as_deref().unwrap().contains("timed out"));
    assert_eq!(
        *log.lock().unwrap(),
        vec!["type html > body > input gs.print(1);".to_string()]
    );
    assert_eq!(fields.lock().unwrap()["html > body > input"], "gs.print(1);");
}

#[tokio::test]
async fn missing_element_is_retried_until_it_appears() {
    let browser = FakeBrowser::new().with_faults(vec![Fault::Before(
        BrowserError::ElementNotFound("html > body > a: element not found".into()),
    )]);
    let log = browser.log.clone();
    let mut session = Session::new(browser, &config());

    let outcome = session.execute(&click(0)).await.unwrap();

    assert!(outcome.observation.success);
    assert_eq!(outcome.observation.url.as_deref(), Some(FORM));
    assert_eq!(log.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn repeatable_actions_retry_until_the_budget_runs_out() {
    let browser = FakeBrowser::new().with_faults(vec![
        Fault::Before(BrowserError::Timeout("extract exceeded 30s".into())),
        Fault::Before(BrowserError::Timeout("extract exceeded 30s".into())),
        Fault::Before(BrowserError::Rejected("page busy".into())),
    ]);
    let log = browser.log.clone();
    let mut session = Session::new(browser, &config());
    let extract = Action::Extract { index: None };

    // one retry allowed: both attempts time out
    let exhausted = session.execute(&extract).await.unwrap();
    assert!(!exhausted.observation.success);
    assert_eq!(
        exhausted.observation.error.as_deref(),
        Some("Browser operation timed out: extract exceeded 30s")
    );

    let recovered = session.execute(&extract).await.unwrap();
    assert!(recovered.observation.success);
    assert_eq!(
        recovered.observation.content.as_deref(),
        Some("contents of https://app.test/home")
    );
    assert_eq!(log.lock().unwrap().len(), 4);
}

#[tokio::test]
async fn framed_element_is_dispatched_through_its_frame_chain() {
    let browser = FakeBrowser::new().at(FRAMED);
    let log = browser.log.clone();
    let mut session = Session::new(browser, &config());

    let page = session.observe().await.unwrap();
    assert_eq!(page.element_count, 2);
    assert!(page.elements.contains("(inside 1 frame(s))"));

    let outcome = session
        .execute(&Action::TypeText {
            index: 0,
            text: "Printer on fire".into(),
        })
        .await
        .unwrap();
    assert!(outcome.observation.success);
    let framed = ElementLocator {
        frames: vec![FrameSelector::Id("gsft_main".into())],
        selector: "html > body > input".into(),
    };
    assert_eq!(outcome.target, Some(framed));
    assert_eq!(
        *log.lock().unwrap(),
        vec![r#"type iframe[id="gsft_main"] >>> html > body > input Printer on fire"#.to_string()]
    );

    // the same selector outside the frame matches nothing
    let flat = ActionRecord {
        action: click(1),
        target: Some(ElementLocator::top_level("html > body > button")),
        observation: Observation::succeeded(None),
    };
    let observation = session.replay(&flat).await.unwrap();
    assert!(!observation.success);
    assert!(observation.error.unwrap().contains("is not on the page"));
    assert_eq!(log.lock().unwrap().len(), 1);
}
