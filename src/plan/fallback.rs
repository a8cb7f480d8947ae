//! Template plan used when no live completion is available.
//!
//! Never calls an upstream service. Known destinations get named attractions
//! wrapped in location markers; anything else gets generic placeholders,
//! which carry no markers and so trigger no places lookups.

use crate::trip::{TripRequest, MAX_DURATION_DAYS};

struct DestinationData {
    key: &'static str,
    attractions: &'static [&'static str],
    food: &'static [&'static str],
    transport: &'static str,
    tip: &'static str,
}

const DESTINATIONS: &[DestinationData] = &[
    DestinationData {
        key: "paris",
        attractions: &[
            "Eiffel Tower",
            "Louvre Museum",
            "Notre-Dame Cathedral",
            "Arc de Triomphe",
            "Sacré-Cœur Basilica",
        ],
        food: &[
            "French bistro",
            "Café de Flore",
            "Local boulangerie",
            "Seine-side restaurant",
        ],
        transport: "Metro day pass (€7.50/day)",
        tip: "Many museums are free on the first Sunday of the month",
    },
    DestinationData {
        key: "london",
        attractions: &[
            "Big Ben",
            "Tower Bridge",
            "British Museum",
            "Hyde Park",
            "Buckingham Palace",
        ],
        food: &[
            "Traditional pub",
            "Borough Market",
            "Fish and chips shop",
            "Afternoon tea",
        ],
        transport: "Oyster Card for the Tube (£15/day)",
        tip: "Most museums are free entry",
    },
    DestinationData {
        key: "rome",
        attractions: &[
            "Colosseum",
            "Vatican City",
            "Trevi Fountain",
            "Roman Forum",
            "Pantheon",
        ],
        food: &["Trattoria", "Gelato shop", "Roman pizzeria", "Osteria"],
        transport: "Roma Pass (€38.50/3 days)",
        tip: "Churches are free; avoid tourist traps next to the big landmarks",
    },
];

const GENERIC_ATTRACTIONS: &[&str] = &[
    "Main attraction",
    "Cultural site",
    "Historic landmark",
    "Local market",
    "Scenic viewpoint",
];

const GENERIC_FOOD: &[&str] = &[
    "Local restaurant",
    "Traditional eatery",
    "Popular café",
    "Street food vendor",
];

fn lookup(destination: &str) -> Option<&'static DestinationData> {
    let destination = destination.to_lowercase();
    DESTINATIONS.iter().find(|d| destination.contains(d.key))
}

/// Deterministic plan for `trip` built from static data.
pub fn template_plan(trip: &TripRequest) -> String {
    let dest = trip.destination.trim();
    let days = trip.duration_days.clamp(1, MAX_DURATION_DAYS) as usize;
    let daily = trip.daily_budget_per_person();
    let data = lookup(dest);

    let attractions: Vec<String> = match data {
        Some(d) => d.attractions.iter().map(|a| format!("[[{}]]", a)).collect(),
        None => GENERIC_ATTRACTIONS.iter().map(|a| a.to_string()).collect(),
    };
    let food = data.map(|d| d.food).unwrap_or(GENERIC_FOOD);
    let transport = data
        .map(|d| d.transport)
        .unwrap_or("Research local transport options");
    let tip = data
        .map(|d| d.tip)
        .unwrap_or("Look for free activities and local deals");

    let mut plan = format!("🌟 {} Travel Plan\n\n", dest);
    for day in 1..=days {
        let theme = if day == 1 {
            "Arrival & First Impressions".to_string()
        } else if day == days {
            "Final Day & Departure".to_string()
        } else {
            format!("Exploring {}", dest)
        };
        plan.push_str(&format!("🗓️ Day {}: {}\n", day, theme));
        plan.push_str(&format!(
            "🏨 Accommodation: Budget hotel (${:.0}/person)\n",
            daily * 0.35
        ));
        if let Some(attraction) = attractions.get(day - 1) {
            plan.push_str(&format!("📍 Visit: {}\n", attraction));
        }
        if day <= food.len() {
            plan.push_str(&format!(
                "🍽️ Lunch: {} (${:.0}/person)\n",
                food[day - 1],
                daily * 0.15
            ));
        }
        plan.push_str("🚶 Evening: Local exploration\n");
        plan.push_str(&format!("💰 Daily total: ${:.0} per person\n\n", daily));
    }
    plan.push_str(&format!("🚌 Transportation: {}\n", transport));
    plan.push_str(&format!("💡 Budget Tip: {}\n", tip));
    plan
}
