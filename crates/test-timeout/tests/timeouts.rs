use std::time::Duration;

use test_timeout::tokio_timeout_test;

#[tokio_timeout_test(2, paused)]
async fn paused_clock_outlasts_the_wall_clock_limit() {
    let start = tokio::time::Instant::now();
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert!(start.elapsed() >= Duration::from_secs(120));
}

#[tokio_timeout_test(2)]
async fn real_clock_body_runs_to_completion() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

#[tokio_timeout_test(1)]
#[should_panic(expected = "test timed out")]
async fn real_clock_body_is_cut_off() {
    tokio::time::sleep(Duration::from_secs(30)).await;
}
