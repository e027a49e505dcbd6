use std::sync::Arc;
use std::time::Duration;

use globset::{Glob, GlobMatcher};
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::behaviors::{BehaviorSpec, RequestSpec, build_behaviors, get, mix, post};
use crate::behavior::{Behavior, Weighted, WeightedSelector, wait_between};
use crate::core::Target;
use crate::session::SessionError;

/// Behavior table for the targets whose id matches `targets`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MixSpec {
    pub targets: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub users: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spawn_rate: Option<u32>,
    pub behaviors: Vec<BehaviorSpec>,
}

/// Actor pacing class. Without wait bounds the behavior's own think time
/// applies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ActorProfileSpec {
    pub name: String,
    pub weight: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_wait_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_wait_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActorProfile {
    pub name: String,
    pub weight: u32,
    pub wait: Option<(Duration, Duration)>,
}

impl ActorProfile {
    pub fn standard() -> Self {
        Self {
            name: "standard".to_string(),
            weight: 1,
            wait: None,
        }
    }

    fn compile(spec: &ActorProfileSpec) -> Result<Self, SessionError> {
        let err = |msg: &str| {
            SessionError::configuration(format!("actor profile `{}`: {msg}", spec.name))
        };
        if spec.weight == 0 {
            return Err(err("weight は 1 以上にしてください"));
        }
        let wait = match (spec.min_wait_ms, spec.max_wait_ms) {
            (None, None) => None,
            (Some(min), Some(max)) if min <= max => {
                Some((Duration::from_millis(min), Duration::from_millis(max)))
            }
            (Some(_), Some(_)) => return Err(err("min_wait_ms が max_wait_ms を超えています")),
            _ => return Err(err("min_wait_ms と max_wait_ms は両方指定してください")),
        };
        Ok(Self {
            name: spec.name.clone(),
            weight: spec.weight,
            wait,
        })
    }

    pub fn think_time<R: Rng + ?Sized>(&self, behavior: &Behavior, rng: &mut R) -> Duration {
        match self.wait {
            Some((min, max)) => wait_between(min, max, rng),
            None => behavior.think_time(rng),
        }
    }
}

impl Weighted for ActorProfile {
    fn weight(&self) -> u32 {
        self.weight
    }
}

#[derive(Debug)]
struct Mix {
    matcher: GlobMatcher,
    behaviors: Arc<WeightedSelector<Behavior>>,
}

/// Everything an actor draws from: the behavior table of its target and
/// its own pacing profile.
#[derive(Debug)]
pub struct Workload {
    fallback: Arc<WeightedSelector<Behavior>>,
    mixes: Vec<Mix>,
    profiles: WeightedSelector<ActorProfile>,
}

impl Workload {
    pub fn build(
        fallback: &[BehaviorSpec],
        mixes: &[MixSpec],
        profiles: &[ActorProfileSpec],
        request_timeout: Duration,
    ) -> Result<Self, SessionError> {
        let fallback = Arc::new(WeightedSelector::new(build_behaviors(
            fallback,
            request_timeout,
        )?)?);

        let mut compiled = Vec::with_capacity(mixes.len());
        for spec in mixes {
            let behaviors = build_behaviors(&spec.behaviors, request_timeout)
                .and_then(WeightedSelector::new)
                .map_err(|e| {
                    SessionError::configuration(format!("mix `{}`: {e}", spec.targets))
                })?;
            compiled.push(Mix {
                matcher: matcher(&spec.targets)?,
                behaviors: Arc::new(behaviors),
            });
        }

        let mut names: Vec<&str> = Vec::new();
        let mut actor_profiles = Vec::with_capacity(profiles.len());
        for spec in profiles {
            if names.contains(&spec.name.as_str()) {
                return Err(SessionError::configuration(format!(
                    "actor profile 名が重複しています: {}",
                    spec.name
                )));
            }
            names.push(&spec.name);
            actor_profiles.push(ActorProfile::compile(spec)?);
        }
        if actor_profiles.is_empty() {
            actor_profiles.push(ActorProfile::standard());
        }

        Ok(Self {
            fallback,
            mixes: compiled,
            profiles: WeightedSelector::new(actor_profiles)?,
        })
    }

    /// One behavior table for every target, standard pacing.
    pub fn uniform(behaviors: WeightedSelector<Behavior>) -> Self {
        Self {
            fallback: Arc::new(behaviors),
            mixes: Vec::new(),
            profiles: WeightedSelector::single(ActorProfile::standard()),
        }
    }

    /// First mix whose glob matches the target id, else the fallback table.
    pub fn behaviors_for(&self, target: &Target) -> &Arc<WeightedSelector<Behavior>> {
        self.mixes
            .iter()
            .find(|m| m.matcher.is_match(&target.id))
            .map_or(&self.fallback, |m| &m.behaviors)
    }

    pub fn pick_profile<R: Rng + ?Sized>(&self, rng: &mut R) -> &ActorProfile {
        self.profiles.select(rng)
    }
}

fn matcher(pattern: &str) -> Result<GlobMatcher, SessionError> {
    Glob::new(pattern.trim())
        .map(|g| g.compile_matcher())
        .map_err(|e| SessionError::configuration(format!("mix の targets が不正です: {pattern}: {e}")))
}

/// The first mix in `mixes` that applies to target `id`.
pub fn mix_for<'a>(mixes: &'a [MixSpec], id: &str) -> Result<Option<&'a MixSpec>, SessionError> {
    for spec in mixes {
        if matcher(&spec.targets)?.is_match(id) {
            return Ok(Some(spec));
        }
    }
    Ok(None)
}

fn waits(mut spec: BehaviorSpec, min_ms: u64, max_ms: u64) -> BehaviorSpec {
    spec.min_wait_ms = min_ms;
    spec.max_wait_ms = max_ms;
    spec
}

fn put(name: &str, path: &str, body: &str) -> RequestSpec {
    RequestSpec {
        method: "PUT".to_string(),
        ..post(name, path, body)
    }
}

fn delete(name: &str, path: &str) -> RequestSpec {
    RequestSpec {
        method: "DELETE".to_string(),
        ..get(name, path)
    }
}

fn repeated(mut request: RequestSpec, range: &str) -> RequestSpec {
    request.repeat = Some(range.to_string());
    request
}

fn service(targets: &str, users: u32, spawn_rate: u32, behaviors: Vec<BehaviorSpec>) -> MixSpec {
    MixSpec {
        targets: targets.to_string(),
        users: Some(users),
        spawn_rate: Some(spawn_rate),
        behaviors,
    }
}

/// A behavior of one request named after it.
fn single(weight: u32, request: RequestSpec, wait_ms: (u64, u64)) -> BehaviorSpec {
    let name = request.name.clone();
    waits(mix(&name, weight, vec![request]), wait_ms.0, wait_ms.1)
}

const USER_BODY: &str = r#"{"firstName": "TestUser{int:1000-9999}", "lastName": "LoadTest", "imageUrl": "https://example.com/avatar.jpg", "email": "test{int:1000-9999}@loadtest.com", "phone": "+1-555-{int:1000-9999}"}"#;
const PRODUCT_BODY: &str = r#"{"productTitle": "Test Product {int:1000-9999}", "imageUrl": "https://example.com/image.jpg", "sku": "SKU-{int:10000-99999}", "priceUnit": {int:10-500}.99, "quantity": {int:1-100}, "categoryDto": {"categoryId": {int:1-3}}}"#;
const CATEGORY_BODY: &str = r#"{"categoryTitle": "Test Category {int:1000-9999}", "imageUrl": "https://example.com/category.jpg"}"#;
const FAVOURITE_BODY: &str = r#"{"userId": {int:1-5}, "productId": {int:1-4}, "likeDate": "{now}"}"#;
const PAYMENT_BODY: &str = r#"{"isPayed": {choice:true|false}, "paymentStatus": "{choice:PENDING|COMPLETED|FAILED}", "order": {"orderId": {int:1-4}}}"#;

/// Direct-to-service tables, used when a single service is loaded without
/// the gateway.
pub fn default_mixes() -> Vec<MixSpec> {
    const FAST: (u64, u64) = (1_000, 3_000);
    const ORDERS: (u64, u64) = (1_000, 4_000);
    const PAYMENTS: (u64, u64) = (2_000, 5_000);

    let users = "/user-service/api/users";
    let products = "/product-service/api/products";
    let categories = "/product-service/api/categories";
    let favourites = "/favourite-service/api/favourites";

    vec![
        service(
            "user-service",
            50,
            5,
            vec![
                single(6, get("users_list", users), FAST),
                single(4, get("user_detail", &format!("{users}/{{int:1-5}}")), FAST),
                single(2, post("create_user", users, USER_BODY), FAST),
                single(1, put("update_user", &format!("{users}/{{int:1-5}}"), USER_BODY), FAST),
            ],
        ),
        service(
            "product-service",
            100,
            10,
            vec![
                single(5, get("products_list", products), FAST),
                single(4, get("product_detail", &format!("{products}/{{int:1-4}}")), FAST),
                single(3, get("categories_list", categories), FAST),
                single(3, get("category_detail", &format!("{categories}/{{int:1-3}}")), FAST),
                single(
                    2,
                    get("category_products", &format!("{categories}/{{int:1-3}}/products")),
                    FAST,
                ),
                single(1, post("create_product", products, PRODUCT_BODY), FAST),
                single(1, post("create_category", categories, CATEGORY_BODY), FAST),
            ],
        ),
        service(
            "order-service",
            80,
            8,
            vec![
                waits(
                    mix(
                        "order_operations",
                        4,
                        vec![
                            get("orders_list", "/order-service/api/orders"),
                            repeated(get("order_detail", "/order-service/api/orders/{int:1-4}"), "2-4"),
                        ],
                    ),
                    ORDERS.0,
                    ORDERS.1,
                ),
                waits(
                    mix(
                        "cart_operations",
                        3,
                        vec![
                            get("carts_list", "/order-service/api/carts"),
                            repeated(
                                post("create_cart", "/order-service/api/carts", r#"{"userId": {int:1-5}}"#),
                                "1-2",
                            ),
                        ],
                    ),
                    ORDERS.0,
                    ORDERS.1,
                ),
            ],
        ),
        service(
            "payment-service",
            60,
            6,
            vec![
                waits(
                    mix(
                        "payment_processing",
                        5,
                        vec![
                            get("payments_list", "/payment-service/api/payments"),
                            repeated(get("payment_detail", "/payment-service/api/payments/{int:1-4}"), "2-4"),
                        ],
                    ),
                    PAYMENTS.0,
                    PAYMENTS.1,
                ),
                waits(
                    mix(
                        "create_payments",
                        3,
                        vec![repeated(post("create_payment", "/payment-service/api/payments", PAYMENT_BODY), "1-3")],
                    ),
                    PAYMENTS.0,
                    PAYMENTS.1,
                ),
            ],
        ),
        service(
            "favourite-service",
            70,
            7,
            vec![
                single(5, get("favourites_list", favourites), FAST),
                single(4, get("favourite_detail", &format!("{favourites}/{{int:1-10}}")), FAST),
                single(3, post("create_favourite", favourites, FAVOURITE_BODY), FAST),
                single(2, put("update_favourite", &format!("{favourites}/{{int:1-10}}"), FAVOURITE_BODY), FAST),
                single(1, delete("delete_favourite", &format!("{favourites}/{{int:1-10}}")), FAST),
            ],
        ),
    ]
}

pub fn default_actor_profiles() -> Vec<ActorProfileSpec> {
    let profile = |name: &str, weight, wait: Option<(u64, u64)>| ActorProfileSpec {
        name: name.to_string(),
        weight,
        min_wait_ms: wait.map(|w| w.0),
        max_wait_ms: wait.map(|w| w.1),
    };
    vec![
        profile("standard", 1, None),
        profile("light", 1, Some((3_000, 8_000))),
        profile("heavy", 3, Some((500, 2_000))),
        profile("spike", 5, Some((100, 1_000))),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load::default_behaviors;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn defaults() -> Workload {
        Workload::build(
            &default_behaviors(),
            &default_mixes(),
            &default_actor_profiles(),
            Duration::from_secs(5),
        )
        .expect("workload")
    }

    fn names(selector: &WeightedSelector<Behavior>) -> Vec<&str> {
        selector.items().iter().map(|b| b.name.as_str()).collect()
    }

    #[test]
    fn each_service_gets_its_own_table() {
        let workload = defaults();
        let users = Target::new("user-service", "http://localhost:8700", "/h");
        let table = workload.behaviors_for(&users);
        assert_eq!(
            names(table),
            vec!["users_list", "user_detail", "create_user", "update_user"]
        );
        assert_eq!(table.total_weight(), 13);

        let gateway = Target::new("api-gateway", "http://localhost:8080", "/h");
        assert_eq!(names(workload.behaviors_for(&gateway))[0], "browse_products");
    }

    #[test]
    fn service_tables_only_hit_their_own_paths() {
        for spec in default_mixes() {
            let prefix = format!("/{}/", spec.targets);
            for b in &spec.behaviors {
                for r in &b.requests {
                    assert!(r.path.starts_with(&prefix), "{}: {}", spec.targets, r.path);
                }
            }
        }
    }

    #[test]
    fn first_matching_mix_wins() {
        let mixes = vec![
            service("pay*", 1, 1, vec![mix("a", 1, vec![get("a", "/a")])]),
            service("*", 2, 2, vec![mix("b", 1, vec![get("b", "/b")])]),
        ];
        assert_eq!(mix_for(&mixes, "payment-service").expect("glob").map(|m| m.users), Some(Some(1)));
        assert_eq!(mix_for(&mixes, "user-service").expect("glob").map(|m| m.users), Some(Some(2)));
        assert_eq!(mix_for(&[], "user-service").expect("glob"), None);
    }

    #[test]
    fn actor_profiles_follow_their_weights() {
        let workload = defaults();
        let mut rng = StdRng::seed_from_u64(11);
        let n = 20_000u32;
        let mut spike = 0u32;
        for _ in 0..n {
            if workload.pick_profile(&mut rng).name == "spike" {
                spike += 1;
            }
        }
        let observed = f64::from(spike) / f64::from(n);
        assert!((observed - 0.5).abs() < 0.02, "spike share {observed:.3}");
    }

    #[test]
    fn profile_wait_overrides_behavior_think_time() {
        let workload = defaults();
        let users = Target::new("user-service", "http://localhost:8700", "/h");
        let behavior = &workload.behaviors_for(&users).items()[0];
        let heavy = ActorProfile::compile(&default_actor_profiles()[2]).expect("heavy");
        let mut rng = StdRng::seed_from_u64(5);
        for _ in 0..500 {
            let t = heavy.think_time(behavior, &mut rng);
            assert!(t >= Duration::from_millis(500) && t <= Duration::from_secs(2));
            let t = ActorProfile::standard().think_time(behavior, &mut rng);
            assert!(t >= Duration::from_secs(1) && t <= Duration::from_secs(3));
        }
    }

    #[test]
    fn invalid_profiles_and_mixes_are_configuration_errors() {
        let half_wait = ActorProfileSpec {
            name: "x".to_string(),
            weight: 1,
            min_wait_ms: Some(10),
            max_wait_ms: None,
        };
        let err = Workload::build(&default_behaviors(), &[], &[half_wait], Duration::from_secs(1))
            .err()
            .expect("half wait bounds");
        assert!(matches!(err, SessionError::Configuration(_)));

        let empty = service("user-service", 1, 1, vec![]);
        let err = Workload::build(&default_behaviors(), &[empty], &[], Duration::from_secs(1))
            .err()
            .expect("empty mix");
        assert!(err.to_string().contains("user-service"));

        let bad_glob = service("[", 1, 1, vec![mix("a", 1, vec![get("a", "/a")])]);
        assert!(Workload::build(&default_behaviors(), &[bad_glob], &[], Duration::from_secs(1)).is_err());
    }

    #[test]
    fn no_profiles_means_standard_pacing() {
        let workload =
            Workload::build(&default_behaviors(), &[], &[], Duration::from_secs(1)).expect("workload");
        let mut rng = StdRng::seed_from_u64(2);
        assert_eq!(workload.pick_profile(&mut rng), &ActorProfile::standard());
    }
}
