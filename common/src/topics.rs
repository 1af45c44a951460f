pub const TOPIC_GARAGE_DOORS: &str = "garageDoors";

pub const BROKER_CLIENT_ID: &str = "GarageDoors";
