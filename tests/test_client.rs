use std::time::Duration;

use courier::{
    error::SendRequestError,
    http::{
        header::{HeaderValue, USER_AGENT},
        Method, StatusCode,
    },
    middleware::{DefaultHeaders, MapErr, Retry},
    test::{Respond, TestConnector, TestDriver},
    Client, PoolConfig,
};

fn client(connector: &TestConnector, driver: &TestDriver) -> Client {
    Client::builder()
        .connector(connector.clone())
        .pool(PoolConfig::fixed(2))
        .finish(driver.clone())
        .host("localhost")
        .port(8080)
}

#[actix_rt::test]
async fn requests_reuse_pooled_connection() {
    let _ = env_logger::try_init();

    let connector = TestConnector::new();
    let driver = TestDriver::new();
    driver.body("hello world");
    let client = client(&connector, &driver);

    for _ in 0..3 {
        let mut res = client.get("/index.html").await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.body().await.unwrap(), "hello world");

        for _ in 0..4 {
            actix_rt::task::yield_now().await;
        }
    }

    assert_eq!(connector.created(), 1);

    let req = driver.last_request().unwrap();
    assert_eq!(*req.method(), Method::GET);
    assert_eq!(req.uri(), "http://localhost:8080/index.html");
}

#[actix_rt::test]
async fn retry_recovers_from_connect_failures() {
    let _ = env_logger::try_init();

    let connector = TestConnector::new();
    let driver = TestDriver::new();
    connector.set_failing(true);

    let client = Client::builder()
        .connector(connector.clone())
        .wrap(Retry::new(2))
        .finish(driver.clone())
        .host("localhost");

    let err = client.get("/").await.unwrap_err();
    assert!(matches!(err, SendRequestError::Connect(_)));
    assert_eq!(connector.attempts(), 3);
    assert_eq!(driver.requests(), 0);

    connector.set_failing(false);
    let res = client.get("/").await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[actix_rt::test]
async fn decorators_compose() {
    let _ = env_logger::try_init();

    let connector = TestConnector::new();
    let driver = TestDriver::new();
    driver.statuses([StatusCode::BAD_GATEWAY, StatusCode::BAD_GATEWAY]);

    let client = Client::builder()
        .connector(connector.clone())
        .wrap(Retry::new(3).policy(vec![StatusCode::BAD_GATEWAY]))
        .wrap(DefaultHeaders::new().header(USER_AGENT, HeaderValue::from_static("courier")))
        .wrap(MapErr::new(|_| SendRequestError::Timeout))
        .finish(driver.clone())
        .host("localhost");

    let res = client.get("/").await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(driver.requests(), 3);
    assert_eq!(
        driver.last_request().unwrap().headers().get(USER_AGENT).unwrap(),
        "courier"
    );

    driver.respond(Respond::WriteError);
    let err = client.get("/").await.unwrap_err();
    assert!(matches!(err, SendRequestError::Timeout));
}

#[actix_rt::test]
async fn client_timeout_interrupts_exchange() {
    let _ = env_logger::try_init();

    let connector = TestConnector::new();
    let driver = TestDriver::new();
    driver.respond(Respond::Hang);

    let client = client(&connector, &driver).timeout(Duration::from_millis(20));

    let err = client.get("/").await.unwrap_err();
    assert!(matches!(err, SendRequestError::Timeout));
    assert_eq!(driver.interrupts(), 1);
    assert_eq!(connector.alive(), 0);
}

#[actix_rt::test]
async fn upgrade_hands_over_connection() {
    let _ = env_logger::try_init();

    let connector = TestConnector::new();
    let driver = TestDriver::new();
    let client = client(&connector, &driver);

    let (head, tunnel) = client.upgrade("/ws").await.unwrap();
    assert_eq!(head.status, StatusCode::SWITCHING_PROTOCOLS);
    assert_eq!(connector.alive(), 1);

    drop(tunnel);
    for _ in 0..4 {
        actix_rt::task::yield_now().await;
    }

    assert_eq!(connector.alive(), 0);

    // the next request needs a fresh connection
    client.get("/").await.unwrap();
    assert_eq!(connector.created(), 2);
}
