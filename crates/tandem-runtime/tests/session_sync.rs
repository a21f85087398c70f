use std::cell::{Cell, RefCell};
use std::rc::Rc;

use serde_json::{Value, json};
use tandem_model::{ChangeKind, ChangeRecord, IdChange, ObjectId};
use tandem_runtime::provider::{
    ObjectRequest, ObjectResponse, QueryRequest, SaveRequest, TypeRequest,
};
use tandem_runtime::{
    BatchState, ProviderError, Providers, Responder, Session, SessionConfig, SyncResponse,
};

/// Responders parked by a fake provider until the test answers them.
type Inbox<T> = Rc<RefCell<Vec<Responder<T>>>>;

fn answer_all<T: 'static>(inbox: &Inbox<T>, mut value: impl FnMut() -> T) {
    let responders: Vec<_> = inbox.borrow_mut().drain(..).collect();
    for responder in responders {
        responder.succeed(value());
    }
}

#[test]
fn optimistic_entities_are_reconciled_after_save() {
    let saved = Rc::new(RefCell::new(Vec::<SaveRequest>::new()));
    let s = Rc::clone(&saved);
    let providers = Providers::new().with_save(move |request: SaveRequest, responder: Responder<SyncResponse>| {
        let id_changes = request
            .changes
            .iter()
            .filter_map(|change| match change {
                ChangeRecord::InitNew { instance } => Some(IdChange::new(
                    instance.type_name().clone(),
                    instance.id().clone(),
                    format!("srv-{}", instance.id().as_str().trim_start_matches("+c")),
                )),
                _ => None,
            })
            .collect();
        s.borrow_mut().push(request);
        responder.succeed(SyncResponse {
            id_changes,
            changes: Vec::new(),
        });
    });
    let session = Session::new(SessionConfig::default(), providers).unwrap();

    let order = session.new_instance("Order");
    let line = session.new_instance("Line");
    session.record(|log| {
        log.add_to_list(order.clone(), "Lines", [line.clone()]);
        log.value_change(line.clone(), "Quantity", json!(0), json!(2));
    });

    session.save(Some(order.clone()), |result| assert!(result.is_ok()));

    assert_eq!(saved.borrow()[0].changes.len(), 4);
    assert_eq!(session.forward("Order", "+c1").as_str(), "srv-1");
    assert_eq!(session.reverse("Line", "srv-2").as_str(), "+c2");

    // A server payload referencing the saved order lands on the local entity.
    let resolved = session.resolve_reference("Order", "srv-1");
    assert!(!resolved.is_ghost());
    assert_eq!(resolved.instance().id().as_str(), "+c1");

    // The next save only carries what changed after the commit.
    session.record(|log| log.value_change(line.clone(), "Quantity", json!(2), json!(3)));
    session.save(None, |result| assert!(result.is_ok()));
    assert_eq!(saved.borrow()[1].changes.len(), 1);

    // Saved entities go out under their server ids.
    let outbound = serde_json::to_value(&saved.borrow()[1].changes[0]).unwrap();
    assert_eq!(
        outbound["instance"],
        json!({ "id": "srv-2", "isNew": false, "type": "Line" })
    );
    // The local log keeps the client id.
    assert_eq!(
        session.changes()[5].instance().map(|i| i.id().as_str().to_string()),
        Some("+c2".to_string())
    );

    let kinds: Vec<ChangeKind> = session.changes().iter().map(ChangeRecord::kind).collect();
    assert_eq!(
        kinds,
        vec![
            ChangeKind::InitNew,
            ChangeKind::InitNew,
            ChangeKind::ListChange,
            ChangeKind::ValueChange,
            ChangeKind::Save,
            ChangeKind::ValueChange,
            ChangeKind::Save,
        ]
    );
}

#[test]
fn concurrent_queries_through_session_are_coalesced() {
    let inbox: Inbox<Value> = Rc::default();
    let calls = Rc::new(Cell::new(0));
    let (i, c) = (Rc::clone(&inbox), Rc::clone(&calls));
    let providers = Providers::new().with_query(move |_: QueryRequest, responder: Responder<Value>| {
        c.set(c.get() + 1);
        i.borrow_mut().push(responder);
    });
    let session = Session::new(SessionConfig::default(), providers).unwrap();
    let request = QueryRequest {
        type_name: "Order".into(),
        filter: Some("open".into()),
        paths: vec!["Lines".into()],
    };

    let results = Rc::new(RefCell::new(Vec::new()));
    for _ in 0..3 {
        let r = Rc::clone(&results);
        session.query(request.clone(), move |result| r.borrow_mut().push(result));
    }
    assert_eq!(calls.get(), 1);

    answer_all(&inbox, || json!([1, 2]));
    assert_eq!(results.borrow().len(), 3);
    assert!(results.borrow().iter().all(|r| *r == Ok(json!([1, 2]))));

    session.query(request, |_| {});
    assert_eq!(calls.get(), 2);
}

#[test]
fn overlapping_object_loads_share_in_flight_ids() {
    let inbox: Inbox<ObjectResponse> = Rc::default();
    let requested = Rc::new(RefCell::new(Vec::new()));
    let (i, r) = (Rc::clone(&inbox), Rc::clone(&requested));
    let providers = Providers::new().with_object(move |request: ObjectRequest, responder: Responder<ObjectResponse>| {
        r.borrow_mut().push(request.ids.clone());
        i.borrow_mut().push(responder);
    });
    let session = Session::new(SessionConfig::default(), providers).unwrap();

    session.fetch_objects("Order", vec!["2".into(), "3".into()], Vec::new(), |_| {});
    let delivered = Rc::new(RefCell::new(Vec::new()));
    let d = Rc::clone(&delivered);
    session.fetch_objects("Order", vec!["1".into(), "2".into()], Vec::new(), move |results| {
        *d.borrow_mut() = results;
    });
    assert_eq!(requested.borrow().len(), 2);
    assert_eq!(requested.borrow()[1], vec![ObjectId::from("1")]);

    let responders: Vec<_> = inbox.borrow_mut().drain(..).collect();
    for responder in responders {
        let ids = ["1", "2", "3"];
        responder.succeed(ids.iter().map(|id| (ObjectId::from(*id), json!(id))).collect());
    }

    let delivered = delivered.borrow();
    let ids: Vec<&str> = delivered.iter().map(|(id, _)| id.as_str()).collect();
    assert_eq!(ids, vec!["1", "2"]);
    assert!(delivered.iter().all(|(_, r)| r.is_ok()));
    assert!(session.is_loaded("Order", "1"));
    assert!(session.is_loaded("Order", "3"));
}

#[test]
fn caller_batch_completes_after_round_trip() {
    let inbox: Inbox<Value> = Rc::default();
    let i = Rc::clone(&inbox);
    let providers = Providers::new().with_type(move |_: TypeRequest, responder: Responder<Value>| {
        i.borrow_mut().push(responder);
    });
    let session = Session::new(SessionConfig::default(), providers).unwrap();
    let events = Rc::new(RefCell::new(Vec::new()));

    let batch = session.batches().start("page load");
    let e = Rc::clone(&events);
    session.batches().when_done(move || e.borrow_mut().push("batch done"));
    let e = Rc::clone(&events);
    session.fetch_type("Order", move |_| e.borrow_mut().push("type loaded"));

    // The caller carries on while the request is outstanding.
    session.batches().end(batch).unwrap();
    assert!(events.borrow().is_empty());

    answer_all(&inbox, || json!({ "name": "Order" }));
    assert_eq!(*events.borrow(), vec!["type loaded", "batch done"]);
}

#[test]
fn failures_reach_the_caller_and_release_the_batch() {
    let providers = Providers::new().with_type(|_: TypeRequest, responder: Responder<Value>| {
        responder.fail("503");
    });
    let session = Session::new(SessionConfig::default(), providers).unwrap();
    let batch = session.batches().start("load");
    let outcome = Rc::new(RefCell::new(None));
    let o = Rc::clone(&outcome);
    session.fetch_type("Order", move |result| *o.borrow_mut() = Some(result));

    assert_eq!(
        outcome.borrow_mut().take(),
        Some(Err(ProviderError::Failed {
            provider: "type".into(),
            message: "503".into()
        }))
    );
    assert_eq!(session.batches().current(), Some(batch));
    session.batches().end(batch).unwrap();
    assert!(session.batches().all().is_empty());
}

#[test]
fn unresolved_references_become_ghosts_until_loaded() {
    let providers = Providers::new().with_object(|request: ObjectRequest, responder: Responder<ObjectResponse>| {
        // The store only knows customer 7.
        let found = request
            .ids
            .into_iter()
            .filter(|id| id.as_str() == "7")
            .map(|id| (id, json!({ "name": "Ada" })))
            .collect();
        responder.succeed(found);
    });
    let session = Session::new(SessionConfig::default(), providers).unwrap();
    assert!(session.resolve_reference("Customer", "7").is_ghost());
    assert!(session.resolve_reference("Customer", "9").is_ghost());

    let results = Rc::new(RefCell::new(Vec::new()));
    let r = Rc::clone(&results);
    session.load_ghosts("Customer", move |res| *r.borrow_mut() = res);

    let results = results.borrow();
    assert!(results[0].1.is_ok());
    assert!(matches!(
        results[1].1,
        Err(ProviderError::MissingResult { .. })
    ));
    assert_eq!(session.ghosts_of("Customer"), vec![ObjectId::from("9")]);
}

#[test]
fn answers_in_reverse_order_resume_each_callers_batch() {
    let inbox: Inbox<Value> = Rc::default();
    let i = Rc::clone(&inbox);
    let providers = Providers::new().with_type(move |_: TypeRequest, responder: Responder<Value>| {
        i.borrow_mut().push(responder);
    });
    let session = Session::new(SessionConfig::default(), providers).unwrap();
    let seen = Rc::new(RefCell::new(Vec::new()));

    let outer = session.batches().start("outer");
    let inner = session.batches().start("inner");
    let (s, b) = (Rc::clone(&seen), session.batches().clone());
    session.fetch_type("A", move |_| s.borrow_mut().push(("A", b.current())));
    let (s, b) = (Rc::clone(&seen), session.batches().clone());
    session.fetch_type("B", move |_| s.borrow_mut().push(("B", b.current())));
    assert_eq!(session.batches().current(), None);

    // A was issued inside `inner`, B inside `outer`; A answers first.
    let mut parked: Vec<_> = inbox.borrow_mut().drain(..).collect();
    let b_responder = parked.pop().unwrap();
    let a_responder = parked.pop().unwrap();
    a_responder.succeed(json!("A"));
    assert!(seen.borrow().is_empty());

    b_responder.succeed(json!("B"));
    session.run_until_idle();

    assert_eq!(
        *seen.borrow(),
        vec![("B", Some(outer)), ("A", Some(inner))]
    );
    assert_eq!(session.batches().state(inner), Some(BatchState::Active));
    assert_eq!(session.batches().state(outer), Some(BatchState::Active));
    assert_eq!(session.batches().current(), Some(inner));

    session.batches().end(inner).unwrap();
    session.batches().end(outer).unwrap();
    assert!(session.batches().all().is_empty());
}
