//! The single consolidated completion prompt.

use crate::cache::completion_key;
use crate::trip::TripRequest;
use crate::upstream::CompletionRequest;

/// Bump when the prompt text changes so old cached completions stop matching.
pub const PROMPT_TEMPLATE_ID: &str = "trip-plan-v2";

pub const SYSTEM_PROMPT: &str =
    "You are a travel planning expert. Create detailed, budget-conscious itineraries.";

/// Model parameters for plan completions.
#[derive(Debug, Clone)]
pub struct CompletionSettings {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f64,
}

impl Default for CompletionSettings {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            max_tokens: 2500,
            temperature: 0.7,
        }
    }
}

pub fn build_prompt(trip: &TripRequest) -> String {
    let destination = match trip.destination_country.as_deref() {
        Some(country) if !country.trim().is_empty() => format!("{}, {}", trip.destination, country),
        _ => trip.destination.clone(),
    };
    let days = trip.duration_days;

    let mut prompt = format!(
        "Create a {days}-day trip plan for {destination}.\n\n\
         Budget: ${budget:.0} for {travelers} travelers (about ${daily:.0} per person per day)\n\
         Interests: {interests}\n",
        days = days,
        destination = destination,
        budget = trip.budget,
        travelers = trip.travelers,
        daily = trip.daily_budget_per_person(),
        interests = trip.interests.as_deref().unwrap_or("General tourism"),
    );
    if let Some(transport) = trip.transportation.as_deref() {
        prompt.push_str(&format!("Transportation: {}\n", transport));
    }
    if let Some(style) = trip.experience_style.as_deref() {
        prompt.push_str(&format!("Experience style: {}\n", style));
    }

    prompt.push_str(&format!(
        "\nFormat with emojis (NO markdown symbols):\n\
         🌟 Trip to {destination}\n\n\
         🗓️ Day 1: [Theme]\n\
         🏨 Hotel: [Name and cost estimate]\n\
         🍽️ Meals: [Restaurant suggestions with costs]\n\
         📍 Activities: [Specific locations with timing]\n\
         💰 Daily cost: $[amount] per person\n\n\
         Continue for all {days} days.\n\n\
         Wrap the name of every specific place a traveler can visit in double \
         square brackets, for example [[Louvre Museum]]. Use brackets only for \
         real, named places.\n\n\
         Include specific restaurant and hotel names, activity costs, \
         transportation tips and local tips. Keep it concise but informative.",
        destination = destination,
        days = days,
    ));
    prompt
}

/// Build the completion call for `trip`, including its cache key.
pub fn completion_request(trip: &TripRequest, settings: &CompletionSettings) -> CompletionRequest {
    CompletionRequest {
        model: settings.model.clone(),
        template_id: PROMPT_TEMPLATE_ID.to_string(),
        system: SYSTEM_PROMPT.to_string(),
        prompt: build_prompt(trip),
        max_tokens: settings.max_tokens,
        temperature: settings.temperature,
        key: completion_key(&settings.model, PROMPT_TEMPLATE_ID, trip),
    }
}
