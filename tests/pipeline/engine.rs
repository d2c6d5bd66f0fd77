//! End-to-end runs against the scripted HTTP server: listing scrape, both
//! model stages, and the JSONL result log.

use crate::support::helpers::{
    article_html, base_config, init_tracing, listing_html, listing_page, read_result_lines,
    temp_result_path, EVALUATION_MODEL, MATCHED_REPLY, NOT_MATCHED_REPLY, OFF_TOPIC_REPLY,
    RELEVANT_REPLY, SCREENING_MODEL,
};
use crate::support::mock_api::{ChatScript, MockApi, MockApiServer};
use newsift::{Runner, TokenUsage};
use serde_json::Value;
use std::time::Duration;
use tokio::time::{sleep, timeout};

#[tokio::test]
async fn full_run_reports_each_verdict_in_listing_order() {
    init_tracing();
    let api = MockApi::new();
    let server = MockApiServer::start(api.clone()).await;

    api.serve_page(
        "/news",
        listing_html(&[
            ("/articles/1", "Story one", "Teaser one"),
            ("/articles/2", "Story two", "Teaser two"),
            ("/articles/3", "Story three", "Teaser three"),
            ("/articles/4", "Story four", "Teaser four"),
        ]),
    );
    api.serve_page("/articles/1", article_html("Story one", "Deep dive into b-trees."));
    api.serve_page("/articles/3", article_html("Story three", "A celebrity gossip roundup."));
    // /articles/4 is not registered, so its fetch sees a 404.

    api.route_chat(SCREENING_MODEL, "Story two", ChatScript::reply(OFF_TOPIC_REPLY, 8, 3));
    api.route_chat(SCREENING_MODEL, "", ChatScript::reply(RELEVANT_REPLY, 8, 3));
    api.route_chat(EVALUATION_MODEL, "Story one", ChatScript::reply(MATCHED_REPLY, 20, 5));
    api.route_chat(EVALUATION_MODEL, "Story three", ChatScript::reply(NOT_MATCHED_REPLY, 18, 4));

    let output = temp_result_path("verdicts");
    let config = base_config(
        server.url(),
        vec![listing_page("news", format!("{}/news", server.url()))],
        &output,
    )
    .concurrency(3)
    .build()
    .expect("config should build");

    let summary = Runner::new(config).run().await.expect("run should succeed");

    assert!(!summary.interrupted);
    assert_eq!(summary.counters.completed, 4);
    assert_eq!(summary.counters.matched, 1);
    assert_eq!(summary.counters.summary_rejected, 1);
    assert_eq!(summary.counters.not_matched, 1);
    assert_eq!(summary.counters.fetch_failed, 1);
    assert_eq!(summary.counters.evaluation_failed, 0);
    assert_eq!(summary.counters.duplicates_skipped, 0);
    assert_eq!(summary.counters.screening_tokens, TokenUsage::new(32, 12));
    assert_eq!(summary.counters.evaluation_tokens, TokenUsage::new(38, 9));

    let lines = read_result_lines(&output);
    assert_eq!(lines.len(), 4);
    for (index, expected_status) in ["matched", "summary_rejected", "not_matched", "fetch_failed"]
        .iter()
        .enumerate()
    {
        let line = &lines[index];
        let expected_link = format!("{}/articles/{}", server.url(), index + 1);
        assert_eq!(line["link"], expected_link.as_str(), "line {index}");
        assert_eq!(line["status"], *expected_status, "line {index}");
        assert_eq!(line["origin"]["page"], "news");
    }
    assert_eq!(lines[0]["analysis"], "covers the criteria head on");
    assert_eq!(lines[1]["analysis"], Value::Null);
    assert!(lines[3]["reason"]
        .as_str()
        .expect("fetch failure carries a reason")
        .contains("404"));

    server.shutdown().await;
    let _ = std::fs::remove_file(&output);
}

#[tokio::test]
async fn duplicate_links_across_pages_are_evaluated_once() {
    init_tracing();
    let api = MockApi::new();
    let server = MockApiServer::start(api.clone()).await;

    api.serve_page(
        "/front",
        listing_html(&[
            ("/articles/7", "Shared story", "Runs on both pages"),
            ("/articles/8", "Front exclusive", "Front only"),
        ]),
    );
    api.serve_page(
        "/tech",
        listing_html(&[
            ("/articles/7", "Shared story", "Runs on both pages"),
            ("/articles/9", "Tech exclusive", "Tech only"),
        ]),
    );
    for path in ["/articles/7", "/articles/8", "/articles/9"] {
        api.serve_page(path, article_html("Any", "Storage engine internals."));
    }
    api.route_chat(EVALUATION_MODEL, "", ChatScript::reply(MATCHED_REPLY, 10, 2));

    let output = temp_result_path("dedupe");
    let config = base_config(
        server.url(),
        vec![
            listing_page("front", format!("{}/front", server.url())),
            listing_page("tech", format!("{}/tech", server.url())),
        ],
        &output,
    )
    .screening_enabled(false)
    .build()
    .expect("config should build");

    let summary = Runner::new(config).run().await.expect("run should succeed");

    assert_eq!(summary.counters.completed, 3);
    assert_eq!(summary.counters.matched, 3);
    assert_eq!(summary.counters.duplicates_skipped, 1);

    let lines = read_result_lines(&output);
    let links: Vec<&str> = lines
        .iter()
        .map(|line| line["link"].as_str().expect("link is a string"))
        .collect();
    assert_eq!(
        links,
        vec![
            format!("{}/articles/7", server.url()),
            format!("{}/articles/8", server.url()),
            format!("{}/articles/9", server.url()),
        ]
    );

    server.shutdown().await;
    let _ = std::fs::remove_file(&output);
}

#[tokio::test]
async fn disabled_screening_goes_straight_to_evaluation() {
    init_tracing();
    let api = MockApi::new();
    let server = MockApiServer::start(api.clone()).await;

    api.serve_page(
        "/news",
        listing_html(&[("/articles/1", "Lone story", "Has a teaser to tempt screening")]),
    );
    api.serve_page("/articles/1", article_html("Lone story", "Write-ahead logging in depth."));
    api.route_chat(EVALUATION_MODEL, "", ChatScript::reply(MATCHED_REPLY, 15, 6));

    let output = temp_result_path("noscreen");
    let config = base_config(
        server.url(),
        vec![listing_page("news", format!("{}/news", server.url()))],
        &output,
    )
    .screening_enabled(false)
    .build()
    .expect("config should build");

    let summary = Runner::new(config).run().await.expect("run should succeed");

    assert_eq!(summary.counters.matched, 1);
    assert_eq!(summary.counters.screening_tokens, TokenUsage::default());
    assert_eq!(summary.counters.evaluation_tokens, TokenUsage::new(15, 6));
    assert_eq!(api.models_called(), vec![EVALUATION_MODEL.to_string()]);

    server.shutdown().await;
    let _ = std::fs::remove_file(&output);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrency_cap_bounds_parallel_model_calls() {
    init_tracing();
    let api = MockApi::new();
    let server = MockApiServer::start(api.clone()).await;

    let rows: Vec<(String, String, String)> = (1..=6)
        .map(|n| {
            (
                format!("/articles/{n}"),
                format!("Story {n}"),
                format!("Teaser {n}"),
            )
        })
        .collect();
    let borrowed: Vec<(&str, &str, &str)> = rows
        .iter()
        .map(|(href, title, teaser)| (href.as_str(), title.as_str(), teaser.as_str()))
        .collect();
    api.serve_page("/news", listing_html(&borrowed));
    for n in 1..=6 {
        api.serve_page(
            format!("/articles/{n}"),
            article_html(&format!("Story {n}"), "Query planner heuristics."),
        );
    }
    api.route_chat(EVALUATION_MODEL, "", ChatScript::reply(MATCHED_REPLY, 5, 1));
    api.set_chat_delay(Duration::from_millis(40));

    let output = temp_result_path("bounded");
    let config = base_config(
        server.url(),
        vec![listing_page("news", format!("{}/news", server.url()))],
        &output,
    )
    .screening_enabled(false)
    .concurrency(2)
    .build()
    .expect("config should build");

    let summary = Runner::new(config).run().await.expect("run should succeed");

    assert_eq!(summary.counters.completed, 6);
    assert_eq!(api.chat_requests(), 6);
    assert!(
        api.peak_in_flight() <= 2,
        "peak of {} parallel calls breaks the cap of 2",
        api.peak_in_flight()
    );

    server.shutdown().await;
    let _ = std::fs::remove_file(&output);
}

#[tokio::test]
async fn transient_api_errors_are_retried_to_success() {
    init_tracing();
    let api = MockApi::new();
    let server = MockApiServer::start(api.clone()).await;

    api.serve_page(
        "/news",
        listing_html(&[("/articles/1", "Flaky story", "Teaser")]),
    );
    api.serve_page("/articles/1", article_html("Flaky story", "Compaction strategies."));
    api.enqueue_chat(EVALUATION_MODEL, ChatScript::status(429, "rate limited"));
    api.enqueue_chat(EVALUATION_MODEL, ChatScript::status(500, "blip"));
    api.enqueue_chat(EVALUATION_MODEL, ChatScript::reply(MATCHED_REPLY, 9, 4));

    let output = temp_result_path("retry");
    let config = base_config(
        server.url(),
        vec![listing_page("news", format!("{}/news", server.url()))],
        &output,
    )
    .screening_enabled(false)
    .build()
    .expect("config should build");

    let summary = Runner::new(config).run().await.expect("run should succeed");

    assert_eq!(summary.counters.matched, 1);
    assert_eq!(summary.counters.evaluation_failed, 0);
    assert_eq!(api.chat_requests(), 3, "one initial call and two retries");
    assert_eq!(summary.counters.evaluation_tokens, TokenUsage::new(9, 4));

    server.shutdown().await;
    let _ = std::fs::remove_file(&output);
}

#[tokio::test]
async fn exhausted_retries_fail_the_item_not_the_run() {
    init_tracing();
    let api = MockApi::new();
    let server = MockApiServer::start(api.clone()).await;

    api.serve_page(
        "/news",
        listing_html(&[("/articles/1", "Doomed story", "Teaser")]),
    );
    api.serve_page("/articles/1", article_html("Doomed story", "Vacuum scheduling."));
    for _ in 0..3 {
        api.enqueue_chat(EVALUATION_MODEL, ChatScript::status(503, "still down"));
    }

    let output = temp_result_path("exhausted");
    let config = base_config(
        server.url(),
        vec![listing_page("news", format!("{}/news", server.url()))],
        &output,
    )
    .screening_enabled(false)
    .build()
    .expect("config should build");

    let summary = Runner::new(config).run().await.expect("run should succeed");

    assert_eq!(summary.counters.completed, 1);
    assert_eq!(summary.counters.evaluation_failed, 1);
    assert_eq!(api.chat_requests(), 3, "retry budget is base plus two");

    let lines = read_result_lines(&output);
    assert_eq!(lines[0]["status"], "evaluation_failed");
    assert!(lines[0]["reason"]
        .as_str()
        .expect("failure carries a reason")
        .contains("503"));

    server.shutdown().await;
    let _ = std::fs::remove_file(&output);
}

#[tokio::test]
async fn auth_rejection_aborts_without_retry() {
    init_tracing();
    let api = MockApi::new();
    let server = MockApiServer::start(api.clone()).await;

    api.serve_page(
        "/news",
        listing_html(&[("/articles/1", "Locked story", "Teaser")]),
    );
    api.serve_page("/articles/1", article_html("Locked story", "Index maintenance."));
    api.enqueue_chat(EVALUATION_MODEL, ChatScript::status(401, "invalid api key"));

    let output = temp_result_path("auth");
    let config = base_config(
        server.url(),
        vec![listing_page("news", format!("{}/news", server.url()))],
        &output,
    )
    .screening_enabled(false)
    .build()
    .expect("config should build");

    let summary = Runner::new(config).run().await.expect("run should succeed");

    assert_eq!(summary.counters.evaluation_failed, 1);
    assert_eq!(api.chat_requests(), 1, "a 401 must not be retried");

    let lines = read_result_lines(&output);
    assert!(lines[0]["reason"]
        .as_str()
        .expect("failure carries a reason")
        .contains("401"));

    server.shutdown().await;
    let _ = std::fs::remove_file(&output);
}

#[tokio::test]
async fn unreadable_listing_page_is_skipped() {
    init_tracing();
    let api = MockApi::new();
    let server = MockApiServer::start(api.clone()).await;

    // "/gone" is never registered; the source should log and move on.
    api.serve_page(
        "/news",
        listing_html(&[("/articles/1", "Surviving story", "Teaser")]),
    );
    api.serve_page("/articles/1", article_html("Surviving story", "Lock-free queues."));
    api.route_chat(EVALUATION_MODEL, "", ChatScript::reply(MATCHED_REPLY, 7, 2));

    let output = temp_result_path("skippage");
    let config = base_config(
        server.url(),
        vec![
            listing_page("gone", format!("{}/gone", server.url())),
            listing_page("news", format!("{}/news", server.url())),
        ],
        &output,
    )
    .screening_enabled(false)
    .build()
    .expect("config should build");

    let summary = Runner::new(config).run().await.expect("run should succeed");

    assert_eq!(summary.counters.completed, 1);
    assert_eq!(summary.counters.matched, 1);
    assert_eq!(read_result_lines(&output).len(), 1);

    server.shutdown().await;
    let _ = std::fs::remove_file(&output);
}

#[tokio::test]
async fn cancellation_interrupts_a_stalled_run() {
    init_tracing();
    let api = MockApi::new();
    let server = MockApiServer::start(api.clone()).await;

    api.serve_page(
        "/news",
        listing_html(&[
            ("/articles/1", "Story one", "Teaser"),
            ("/articles/2", "Story two", "Teaser"),
            ("/articles/3", "Story three", "Teaser"),
        ]),
    );
    for n in 1..=3 {
        api.serve_page(
            format!("/articles/{n}"),
            article_html(&format!("Story {n}"), "Never finishes evaluating."),
        );
    }
    api.route_chat(EVALUATION_MODEL, "", ChatScript::reply(MATCHED_REPLY, 1, 1));
    api.set_chat_delay(Duration::from_secs(5));

    let output = temp_result_path("interrupt");
    let config = base_config(
        server.url(),
        vec![listing_page("news", format!("{}/news", server.url()))],
        &output,
    )
    .screening_enabled(false)
    .concurrency(2)
    .build()
    .expect("config should build");

    let runner = Runner::new(config);
    let cancellation = runner.cancellation_token();
    let run = tokio::spawn(async move { runner.run().await });

    sleep(Duration::from_millis(150)).await;
    cancellation.cancel();

    let summary = timeout(Duration::from_secs(2), run)
        .await
        .expect("cancelled run should unwind promptly")
        .expect("run task should not panic")
        .expect("interrupted run still returns a summary");

    assert!(summary.interrupted);
    assert_eq!(summary.counters.completed, 0);
    assert!(output.exists(), "the result log is created up front");

    // Skip the graceful shutdown: it would wait out the scripted delay on
    // the aborted calls.
    drop(server);
    let _ = std::fs::remove_file(&output);
}
